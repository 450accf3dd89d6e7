use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::metadata::TableName;
use crate::task::{TaskId, TaskState, TaskType};

/// Una cola de tareas: par (tabla, tipo de tarea).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    pub table: TableName,
    pub task_type: TaskType,
}

/// Conteos de una cola para operadores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub table: TableName,
    pub task_type: TaskType,
    pub not_started: u32,
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub aborted: u32,
    pub timed_out: u32,
    /// Sub-tareas esperando un worker.
    pub pending_sub_tasks: u32,
    /// Sub-tareas con lease vigente.
    pub in_flight_sub_tasks: u32,
}

impl QueueCounts {
    /// Conteos en cero para la cola `key`.
    pub fn new(key: &QueueKey) -> Self {
        Self {
            table: key.table.clone(),
            task_type: key.task_type,
            not_started: 0,
            running: 0,
            completed: 0,
            failed: 0,
            aborted: 0,
            timed_out: 0,
            pending_sub_tasks: 0,
            in_flight_sub_tasks: 0,
        }
    }

    pub fn bump(&mut self, state: TaskState) {
        match state {
            TaskState::NotStarted => self.not_started += 1,
            TaskState::Running => self.running += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Aborted => self.aborted += 1,
            TaskState::TimedOut => self.timed_out += 1,
        }
    }
}

pub type TaskStates = BTreeMap<TaskId, TaskState>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResponse {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortResponse {
    pub task_id: TaskId,
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSegmentsResponse {
    /// Segmentos que no estaban en el metadata store.
    pub registered: usize,
    pub scanned: usize,
}
