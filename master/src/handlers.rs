use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    record_optimization, AbortResponse, QueueCounts, QueueKey, RecordOptimizationRequest,
    RecordOptimizationResponse, ScheduleResponse, SegmentMetadata, StoreError,
    SyncSegmentsResponse, TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest,
    TaskCompleteResponse, TaskStates, TaskType, Versioned, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::queue::QueueError;
use crate::scheduler::scheduling_pass;
use crate::segments::{sync_segments, SyncError};
use crate::state::{AppState, PoisonedLock, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/queues", get(list_queues))
        .route("/api/v1/queues/counts", get(queue_counts))
        .route("/api/v1/tasks/states/:task_type", get(task_states))
        .route("/api/v1/tasks/schedule", post(schedule_now))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .route("/api/v1/tasks/:id/abort", post(abort_task))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/segments/sync", post(sync_segments_now))
        .route("/api/v1/segments/optimizations", post(record_segment_optimization))
        .route("/api/v1/segments/:table", get(list_segments))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- mapeo de errores ---------------- */

fn lock_status(e: PoisonedLock) -> StatusCode {
    warn!("{}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn queue_status(e: &QueueError) -> StatusCode {
    match e {
        QueueError::UnknownTask(_) | QueueError::UnknownSubTask { .. } => StatusCode::NOT_FOUND,
        QueueError::StaleLease { .. } | QueueError::TaskFinished { .. } => StatusCode::CONFLICT,
        QueueError::SegmentInFlight { .. } => StatusCode::CONFLICT,
        QueueError::EmptyTask => StatusCode::BAD_REQUEST,
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StoreError::SegmentNotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Conflict { .. } => StatusCode::CONFLICT,
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn list_queues(State(state): State<AppState>) -> Result<Json<Vec<QueueKey>>, StatusCode> {
    let queues = state.lock_queues().map_err(lock_status)?;
    Ok(Json(queues.list_queues()))
}

async fn queue_counts(
    State(state): State<AppState>,
) -> Result<Json<Vec<QueueCounts>>, StatusCode> {
    let queues = state.lock_queues().map_err(lock_status)?;
    Ok(Json(queues.queue_counts()))
}

async fn task_states(
    State(state): State<AppState>,
    Path(task_type): Path<String>,
) -> Result<Json<TaskStates>, StatusCode> {
    let task_type: TaskType = task_type.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let queues = state.lock_queues().map_err(lock_status)?;
    Ok(Json(queues.get_task_states(task_type)))
}

// Fuerza una pasada del scheduler sin esperar al intervalo
async fn schedule_now(State(state): State<AppState>) -> Result<Json<ScheduleResponse>, StatusCode> {
    let task_ids = tokio::task::spawn_blocking(move || scheduling_pass(&state, Utc::now()))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(ScheduleResponse { task_ids }))
}

// Entrega la siguiente sub-tarea pendiente (si hay) con un lease
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Result<Json<TaskAssignmentResponse>, StatusCode> {
    {
        let mut workers = state.lock_workers().map_err(lock_status)?;
        let meta = workers.get_mut(&req.worker_id).ok_or(StatusCode::NOT_FOUND)?;
        meta.last_pull = Some(SystemTime::now());
    }

    let task = {
        let mut queues = state.lock_queues().map_err(lock_status)?;
        queues.pull(&req.worker_id, Utc::now(), state.config.lease())
    };

    if task.is_some() {
        let mut workers = state.lock_workers().map_err(lock_status)?;
        if let Some(meta) = workers.get_mut(&req.worker_id) {
            meta.tasks_started += 1;
        }
    }

    Ok(Json(TaskAssignmentResponse { task }))
}

// El worker reporta cómo le fue con su sub-tarea
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    let outcome = {
        let mut queues = state.lock_queues().map_err(lock_status)?;
        queues.report(&req, Utc::now())
    };

    let outcome = match outcome {
        Ok(o) => o,
        Err(e) => {
            warn!("reporte rechazado de {}: {}", req.worker_id, e);
            return Err(queue_status(&e));
        }
    };

    {
        let mut workers = state.lock_workers().map_err(lock_status)?;
        if let Some(meta) = workers.get_mut(&req.worker_id) {
            meta.total_task_time_ms += outcome.elapsed_ms;
            if req.success {
                meta.tasks_succeeded += 1;
            } else {
                meta.tasks_failed += 1;
            }
        }
    }

    Ok(Json(TaskCompleteResponse {
        ok: true,
        task_state: outcome.task_state,
    }))
}

async fn abort_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AbortResponse>, StatusCode> {
    let mut queues = state.lock_queues().map_err(lock_status)?;
    let task_state = queues
        .abort(&id, Utc::now())
        .map_err(|e| queue_status(&e))?;
    Ok(Json(AbortResponse {
        task_id: id,
        state: task_state,
    }))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Result<Json<WorkerRegisterResponse>, StatusCode> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    {
        let mut workers = state.lock_workers().map_err(lock_status)?;
        workers.insert(worker_id.clone(), WorkerMeta::new(req.hostname.clone()));
    }

    info!("worker registrado: {} ({})", worker_id, req.hostname);
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerMetrics>>, StatusCode> {
    let now = SystemTime::now();

    let active_by_worker = state.lock_queues().map_err(lock_status)?.active_by_worker();

    let workers = state.lock_workers().map_err(lock_status)?;
    let mut out: Vec<WorkerMetrics> = workers
        .iter()
        .map(|(wid, meta)| {
            let finished = meta.tasks_succeeded + meta.tasks_failed;
            WorkerMetrics {
                worker_id: wid.clone(),
                hostname: meta.hostname.clone(),
                registered_secs_ago: now
                    .duration_since(meta.registered_at)
                    .unwrap_or_default()
                    .as_secs(),
                last_pull_secs_ago: meta
                    .last_pull
                    .map(|t| now.duration_since(t).unwrap_or_default().as_secs()),
                active_sub_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
                tasks_started: meta.tasks_started,
                tasks_succeeded: meta.tasks_succeeded,
                tasks_failed: meta.tasks_failed,
                avg_task_ms: (finished > 0)
                    .then(|| meta.total_task_time_ms as f64 / finished as f64),
            }
        })
        .collect();
    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

    Ok(Json(out))
}

async fn list_segments(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Json<Vec<Versioned<SegmentMetadata>>>, StatusCode> {
    state
        .metadata
        .list_segments(&table)
        .map(Json)
        .map_err(|e| {
            warn!("no se pudieron listar segmentos de {}: {}", table, e);
            store_status(&e)
        })
}

async fn sync_segments_now(
    State(state): State<AppState>,
) -> Result<Json<SyncSegmentsResponse>, StatusCode> {
    let res = tokio::task::spawn_blocking(move || sync_segments(&state))
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match res {
        Ok(r) => Ok(Json(r)),
        Err(SyncError::Store(e)) => Err(store_status(&e)),
        Err(e @ SyncError::Segment(_)) => {
            warn!("sync de segmentos falló: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// Deja el tag de optimización en el metadata store (CAS, idempotente)
async fn record_segment_optimization(
    State(state): State<AppState>,
    Json(req): Json<RecordOptimizationRequest>,
) -> Result<Json<RecordOptimizationResponse>, StatusCode> {
    let added = record_optimization(state.metadata.as_ref(), &req.table, &req.segment, &req.tag)
        .map_err(|e| {
            warn!(
                "no se pudo registrar {} en {}/{}: {}",
                req.tag, req.table, req.segment, e
            );
            store_status(&e)
        })?;

    if added {
        info!("{}/{} marcado con {}", req.table, req.segment, req.tag);
    }
    Ok(Json(RecordOptimizationResponse { added }))
}
