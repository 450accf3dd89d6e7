use serde::{Deserialize, Serialize};

use crate::task::{SubTaskSpec, TaskId, TaskState};

pub type WorkerId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub task: Option<SubTaskSpec>,
}

/// Estado final de una sub-tarea reportado por el worker que la tiene.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteRequest {
    pub task_id: TaskId,
    pub index: usize,
    pub worker_id: WorkerId,
    pub attempt: u32,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteResponse {
    pub ok: bool,
    /// Estado de la tarea después de aplicar el reporte.
    pub task_state: TaskState,
}

/// Pedido para dejar el tag de optimización en el metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOptimizationRequest {
    pub table: String,
    pub segment: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOptimizationResponse {
    /// false si el tag ya estaba.
    pub added: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub registered_secs_ago: u64,
    pub last_pull_secs_ago: Option<u64>,
    pub active_sub_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
}
