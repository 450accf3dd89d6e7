// master/src/state.rs

use common::{MetadataStore, SegmentStore, TableName, TableTaskConfig, WorkerId};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};
use thiserror::Error;

use crate::config::MasterConfig;
use crate::queue::TaskQueues;

#[derive(Debug, Error)]
#[error("lock envenenado: {0}")]
pub struct PoisonedLock(pub &'static str);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<MasterConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub segments: SegmentStore,
    // tabla -> tipo de tarea -> parámetros
    pub table_configs: Arc<BTreeMap<TableName, TableTaskConfig>>,
    pub queues: Arc<Mutex<TaskQueues>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
}

impl AppState {
    pub fn new(
        config: MasterConfig,
        metadata: Arc<dyn MetadataStore>,
        table_configs: BTreeMap<TableName, TableTaskConfig>,
    ) -> Self {
        Self {
            segments: SegmentStore::new(config.segment_dir.clone()),
            config: Arc::new(config),
            metadata,
            table_configs: Arc::new(table_configs),
            queues: Arc::new(Mutex::new(TaskQueues::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn lock_queues(&self) -> Result<MutexGuard<'_, TaskQueues>, PoisonedLock> {
        self.queues.lock().map_err(|_| PoisonedLock("queues"))
    }

    pub fn lock_workers(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<WorkerId, WorkerMeta>>, PoisonedLock> {
        self.workers.lock().map_err(|_| PoisonedLock("workers"))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub registered_at: SystemTime,
    pub last_pull: Option<SystemTime>,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,
}

impl WorkerMeta {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname,
            registered_at: SystemTime::now(),
            last_pull: None,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
        }
    }
}
