use anyhow::{bail, Result};
use common::{
    ConversionOutcome, ExecutorRegistry, RecordOptimizationRequest, RecordOptimizationResponse,
    SegmentStore, SubTaskSpec, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, WorkerId, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use reqwest::{Client, StatusCode};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WORKER_CONCURRENCY: usize = 1;
const DEFAULT_IDLE_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_url: String,
    pub segment_dir: PathBuf,
    pub concurrency: usize,
    pub idle_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            master_url: env::var("MASTER_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            segment_dir: env::var("SEGMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/data/segments")),
            concurrency: env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            idle_backoff: Duration::from_millis(
                env::var("WORKER_IDLE_BACKOFF_MS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_IDLE_BACKOFF_MS),
            ),
        }
    }
}

async fn register(client: &Client, base_url: &str) -> Result<WorkerId> {
    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let url = format!("{}/api/v1/workers/register", base_url);
    let res = client
        .post(&url)
        .json(&WorkerRegisterRequest { hostname })
        .send()
        .await?;
    if !res.status().is_success() {
        bail!("registro rechazado por el master (status {})", res.status());
    }
    let WorkerRegisterResponse { worker_id } = res.json().await?;
    Ok(worker_id)
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Pide sub-tareas mientras tenga "slots" libres.
/// - Ejecuta cada una en un hilo de bloqueo y reporta el resultado.
pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = WorkerConfig::from_env();
    let client = Client::new();
    let base_url = config.master_url.clone();
    let registry = Arc::new(ExecutorRegistry::with_defaults(SegmentStore::new(
        config.segment_dir.clone(),
    )));

    let mut worker_id = register(&client, &base_url).await?;
    info!(
        "worker {} registrado con concurrency={} contra {} (segmentos en {})",
        worker_id,
        config.concurrency,
        base_url,
        config.segment_dir.display()
    );

    let sem = Arc::new(Semaphore::new(config.concurrency));

    loop {
        // --------- Control de concurrencia local ---------
        let permit = sem.clone().acquire_owned().await?;

        // Pedimos sub-tarea al master
        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let res = client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await;

        let res = match res {
            Ok(r) => r,
            Err(e) => {
                warn!("master no responde: {}", e);
                drop(permit);
                sleep(config.idle_backoff).await;
                continue;
            }
        };

        if res.status() == StatusCode::NOT_FOUND {
            // el master no nos conoce (p.ej. se reinició): registrarse de nuevo
            drop(permit);
            match register(&client, &base_url).await {
                Ok(id) => {
                    warn!("re-registrado como {}", id);
                    worker_id = id;
                }
                Err(e) => {
                    warn!("no se pudo re-registrar: {}", e);
                    sleep(config.idle_backoff).await;
                }
            }
            continue;
        }

        let assignment: TaskAssignmentResponse = match res.json().await {
            Ok(a) => a,
            Err(e) => {
                warn!("respuesta inválida de {}: {}", assign_url, e);
                drop(permit);
                sleep(config.idle_backoff).await;
                continue;
            }
        };

        if let Some(spec) = assignment.task {
            info!(
                "tengo sub-tarea {}/{} ({} {}/{}, intento {})",
                spec.task_id, spec.index, spec.task_type, spec.table, spec.segment, spec.attempt
            );

            // Clonar lo que usamos en la tarea asíncrona
            let client_cloned = client.clone();
            let base_url_cloned = base_url.clone();
            let registry_cloned = registry.clone();
            let worker_id_cloned = worker_id.clone();

            tokio::spawn(async move {
                process_sub_task(
                    &client_cloned,
                    &base_url_cloned,
                    &registry_cloned,
                    &worker_id_cloned,
                    spec,
                )
                .await;

                // Liberar el "slot" de concurrencia al terminar
                drop(permit);
            });
        } else {
            // No hay trabajo: devolvemos el permiso y dormimos
            drop(permit);
            debug!("worker {} pidió sub-tarea pero no hay", worker_id);
            sleep(config.idle_backoff).await;
        }
    }
}

/// Ejecuta, registra el tag y reporta. Nunca devuelve error: cualquier falla
/// termina en un reporte con success=false.
async fn process_sub_task(
    client: &Client,
    base_url: &str,
    registry: &Arc<ExecutorRegistry>,
    worker_id: &str,
    spec: SubTaskSpec,
) {
    let (success, message) = match execute_and_record(client, base_url, registry, &spec).await {
        Ok(outcome) => {
            info!("terminé {}/{}: {:?}", spec.task_id, spec.index, outcome);
            (true, None)
        }
        Err(e) => {
            warn!("error procesando {}/{}: {:#}", spec.task_id, spec.index, e);
            (false, Some(format!("{:#}", e)))
        }
    };

    let complete_url = format!("{}/api/v1/tasks/complete", base_url);
    let res = client
        .post(&complete_url)
        .json(&TaskCompleteRequest {
            task_id: spec.task_id.clone(),
            index: spec.index,
            worker_id: worker_id.to_string(),
            attempt: spec.attempt,
            success,
            message,
        })
        .send()
        .await;

    match res {
        Ok(r) if r.status().is_success() => {
            if let Ok(resp) = r.json::<TaskCompleteResponse>().await {
                debug!("tarea {} ahora {:?}", spec.task_id, resp.task_state);
            }
        }
        // lease vencido o tarea abortada: el master ya no espera este reporte
        Ok(r) if r.status() == StatusCode::CONFLICT => {
            warn!("reporte de {}/{} descartado por el master", spec.task_id, spec.index);
        }
        Ok(r) => warn!("reporte de {}/{} devolvió {}", spec.task_id, spec.index, r.status()),
        Err(e) => warn!("no se pudo reportar {}/{}: {}", spec.task_id, spec.index, e),
    }
}

/// Corre el executor en un hilo de bloqueo.
pub async fn execute_blocking(
    registry: Arc<ExecutorRegistry>,
    spec: SubTaskSpec,
) -> Result<ConversionOutcome> {
    tokio::task::spawn_blocking(move || registry.execute(&spec)).await?
}

async fn execute_and_record(
    client: &Client,
    base_url: &str,
    registry: &Arc<ExecutorRegistry>,
    spec: &SubTaskSpec,
) -> Result<ConversionOutcome> {
    let outcome = execute_blocking(registry.clone(), spec.clone()).await?;

    // también con AlreadyApplied: un intento anterior pudo publicar sin
    // llegar a registrar el tag
    let url = format!("{}/api/v1/segments/optimizations", base_url);
    let res = client
        .post(&url)
        .json(&RecordOptimizationRequest {
            table: spec.table.clone(),
            segment: spec.segment.clone(),
            tag: spec.task_type.optimization_tag().to_string(),
        })
        .send()
        .await?;
    if !res.status().is_success() {
        bail!(
            "el master no registró {} en {}/{} (status {})",
            spec.task_type.optimization_tag(),
            spec.table,
            spec.segment,
            res.status()
        );
    }
    let RecordOptimizationResponse { added } = res.json().await?;
    if !added {
        debug!("{}/{} ya tenía el tag", spec.table, spec.segment);
    }

    Ok(outcome)
}
