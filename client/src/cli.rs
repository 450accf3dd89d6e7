use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    AbortResponse, QueueCounts, QueueKey, ScheduleResponse, SegmentMetadata,
    SyncSegmentsResponse, TaskStates, Versioned, WorkerMetrics,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::env;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para operar las tareas de optimización de segmentos")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lista las colas (tabla, tipo de tarea)
    Queues,

    /// Conteos por cola: tareas por estado y sub-tareas pendientes
    Counts,

    /// Estado de cada tarea de un tipo
    Tasks {
        #[arg(value_name = "TASK_TYPE", default_value = "ConvertToRawIndexTask")]
        task_type: String,
    },

    /// Fuerza una pasada del scheduler
    Schedule,

    /// Aborta una tarea
    Abort {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },

    Workers,

    /// Metadata de los segmentos de una tabla
    Segments {
        #[arg(value_name = "TABLA")]
        table: String,
    },

    /// Registra segmentos nuevos que estén en disco
    Sync,
}

async fn json_or_bail<T: DeserializeOwned>(resp: Response, what: &str) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        bail!("error consultando {} (status {})", what, status);
    }
    Ok(resp.json().await?)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Queues => {
            let url = format!("{}/api/v1/queues", base_url);
            let queues: Vec<QueueKey> = json_or_bail(client.get(&url).send().await?, &url).await?;
            if queues.is_empty() {
                println!("No hay colas todavía.");
            }
            for q in queues {
                println!("{:<30} {}", q.table, q.task_type);
            }
        }

        Commands::Counts => {
            let url = format!("{}/api/v1/queues/counts", base_url);
            let counts: Vec<QueueCounts> =
                json_or_bail(client.get(&url).send().await?, &url).await?;
            for c in counts {
                println!("{} / {}", c.table, c.task_type);
                println!(
                    "  tareas     : not_started={}, running={}, completed={}, failed={}, aborted={}, timed_out={}",
                    c.not_started, c.running, c.completed, c.failed, c.aborted, c.timed_out
                );
                println!(
                    "  sub-tareas : pendientes={}, en vuelo={}",
                    c.pending_sub_tasks, c.in_flight_sub_tasks
                );
            }
        }

        Commands::Tasks { task_type } => {
            let url = format!("{}/api/v1/tasks/states/{}", base_url, task_type);
            let states: TaskStates = json_or_bail(client.get(&url).send().await?, &url).await?;
            if states.is_empty() {
                println!("No hay tareas de tipo {}.", task_type);
            }
            for (id, state) in states {
                println!("{:<45} {:?}", id, state);
            }
        }

        Commands::Schedule => {
            let url = format!("{}/api/v1/tasks/schedule", base_url);
            let resp: ScheduleResponse =
                json_or_bail(client.post(&url).send().await?, &url).await?;
            if resp.task_ids.is_empty() {
                println!("El scheduler no creó tareas.");
            } else {
                println!("Tareas creadas:");
                for id in resp.task_ids {
                    println!("  - {}", id);
                }
            }
        }

        Commands::Abort { id } => {
            let url = format!("{}/api/v1/tasks/{}/abort", base_url, id);
            let resp = client.post(&url).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                println!("No se encontró la tarea {id}");
            } else {
                let aborted: AbortResponse = json_or_bail(resp, &url).await?;
                println!("Tarea {} -> {:?}", aborted.task_id, aborted.state);
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let workers: Vec<WorkerMetrics> =
                json_or_bail(client.get(&url).send().await?, &url).await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  registrado     : {} s ago", w.registered_secs_ago);
                match w.last_pull_secs_ago {
                    Some(s) => println!("  último pull    : {} s ago", s),
                    None => println!("  último pull    : (nunca)"),
                }
                println!("  en vuelo       : {}", w.active_sub_tasks);
                println!(
                    "  tareas         : started={}, ok={}, failed={}",
                    w.tasks_started, w.tasks_succeeded, w.tasks_failed
                );
                if let Some(avg) = w.avg_task_ms {
                    println!("  avg_task_ms    : {:.1}", avg);
                } else {
                    println!("  avg_task_ms    : (sin datos)");
                }
                println!();
            }
        }

        Commands::Segments { table } => {
            let url = format!("{}/api/v1/segments/{}", base_url, table);
            let segments: Vec<Versioned<SegmentMetadata>> =
                json_or_bail(client.get(&url).send().await?, &url).await?;
            if segments.is_empty() {
                println!("La tabla {} no tiene segmentos registrados.", table);
            }
            for seg in segments {
                let meta = seg.value;
                let dict: Vec<&str> = meta
                    .columns
                    .iter()
                    .filter(|(_, c)| c.has_dictionary)
                    .map(|(name, _)| name.as_str())
                    .collect();
                println!("{} (v{})", meta.segment_name, seg.version);
                println!("  docs           : {}", meta.total_docs);
                println!("  optimizaciones : {:?}", meta.optimizations);
                println!("  con diccionario: {:?}", dict);
            }
        }

        Commands::Sync => {
            let url = format!("{}/api/v1/segments/sync", base_url);
            let resp: SyncSegmentsResponse =
                json_or_bail(client.post(&url).send().await?, &url).await?;
            println!(
                "{} segmentos en disco, {} registrados ahora",
                resp.scanned, resp.registered
            );
        }
    }

    Ok(())
}
