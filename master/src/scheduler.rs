// master/src/scheduler.rs

use chrono::{DateTime, Utc};
use common::{
    ConfigError, ConvertToRawIndexParams, StoreError, TaskId, TaskType, TaskTypeConfig,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::queue::{QueueError, TaskDraft};
use crate::segments::sync_segments;
use crate::state::{AppState, PoisonedLock};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("configuración inválida: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lock(#[from] PoisonedLock),
}

/// Parámetros comunes a cualquier tipo de tarea: tope de segmentos por
/// tarea y columnas de cada sub-tarea.
struct BatchParams {
    max_per_task: usize,
    columns: Vec<String>,
}

fn batch_params(task_type: TaskType, config: &TaskTypeConfig) -> Result<BatchParams, ConfigError> {
    match task_type {
        TaskType::ConvertToRawIndexTask => {
            let p = ConvertToRawIndexParams::from_config(config)?;
            Ok(BatchParams {
                max_per_task: p.max_tasks_per_batch,
                columns: p.columns,
            })
        }
    }
}

/// Una pasada del scheduler sobre todas las tablas configuradas, en orden.
/// Una tabla con problemas se salta sin frenar a las demás.
pub fn schedule_tasks(state: &AppState, now: DateTime<Utc>) -> Vec<TaskId> {
    let mut created = Vec::new();

    for (table, table_config) in state.table_configs.iter() {
        for (task_type, config) in table_config {
            match schedule_table(state, table, *task_type, config, now) {
                Ok(Some(id)) => created.push(id),
                Ok(None) => {}
                Err(e) => warn!(
                    "saltando {} de la tabla {} en esta pasada: {}",
                    task_type, table, e
                ),
            }
        }
    }

    created
}

/// Arma y encola a lo sumo una tarea para (tabla, tipo).
pub fn schedule_table(
    state: &AppState,
    table: &str,
    task_type: TaskType,
    config: &TaskTypeConfig,
    now: DateTime<Utc>,
) -> Result<Option<TaskId>, ScheduleError> {
    let params = batch_params(task_type, config)?;
    let tag = task_type.optimization_tag();

    // la foto de las colas va antes que la del store: una tarea que termina
    // en el medio ya dejó su tag registrado
    let cooldown_start = now
        .checked_sub_signed(state.config.cooldown())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let (in_flight, cooling) = {
        let queues = state.lock_queues()?;
        (
            queues.in_flight_segments(table, task_type),
            queues.recently_failed_segments(table, task_type, cooldown_start),
        )
    };
    let segments = state.metadata.list_segments(table)?;

    let mut candidates: Vec<String> = segments
        .into_iter()
        .map(|v| v.value)
        .filter(|m| !m.has_optimization(tag))
        .map(|m| m.segment_name)
        .filter(|s| !in_flight.contains(s) && !cooling.contains(s))
        .collect();

    if candidates.is_empty() {
        debug!("{}: nada que hacer para {}", table, task_type);
        return Ok(None);
    }

    candidates.sort();
    candidates.truncate(params.max_per_task);

    let draft = TaskDraft {
        table: table.to_string(),
        task_type,
        sub_tasks: candidates
            .into_iter()
            .map(|s| (s, params.columns.clone()))
            .collect(),
    };

    let mut queues = state.lock_queues()?;
    match queues.enqueue_if_disjoint(draft, now) {
        Ok(id) => Ok(Some(id)),
        Err(QueueError::SegmentInFlight { segment, task_id }) => {
            // otra pasada concurrente ganó la carrera; se reintenta en la próxima
            info!(
                "{}: el segmento {} ya quedó en {}, no se crea tarea",
                table, segment, task_id
            );
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Sync de segmentos + scheduling + limpieza de tareas viejas.
pub fn scheduling_pass(state: &AppState, now: DateTime<Utc>) -> Vec<TaskId> {
    if let Err(e) = sync_segments(state) {
        warn!("sync de segmentos falló: {}", e);
    }

    let created = schedule_tasks(state, now);
    if !created.is_empty() {
        info!("scheduler creó {} tareas: {:?}", created.len(), created);
    }

    match state.lock_queues() {
        Ok(mut queues) => {
            let pruned = queues.prune_finished(now, state.config.retention());
            if pruned > 0 {
                debug!("{} tareas terminadas olvidadas", pruned);
            }
        }
        Err(e) => warn!("no se pudo limpiar la cola: {}", e),
    }

    created
}

/// Loop periódico del scheduler.
pub async fn run_scheduler_loop(state: AppState) {
    loop {
        sleep(state.config.schedule_interval).await;

        let pass_state = state.clone();
        let res =
            tokio::task::spawn_blocking(move || scheduling_pass(&pass_state, Utc::now())).await;
        if let Err(e) = res {
            warn!("pasada del scheduler abortó: {:?}", e);
        }
    }
}
