use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::convert::{ConversionOutcome, ConvertToRawIndexExecutor};
use crate::segment_store::SegmentStore;
use crate::task::{SubTaskSpec, TaskType};

/// Ejecuta una sub-tarea de un tipo concreto sobre un segmento.
pub trait TaskExecutor: Send + Sync {
    fn task_type(&self) -> TaskType;

    fn execute(&self, spec: &SubTaskSpec) -> Result<ConversionOutcome>;
}

impl TaskExecutor for ConvertToRawIndexExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::ConvertToRawIndexTask
    }

    fn execute(&self, spec: &SubTaskSpec) -> Result<ConversionOutcome> {
        Ok(self.convert(&spec.table, &spec.segment, &spec.columns)?)
    }
}

/// Tipo de tarea -> executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registro con todos los executors que vienen incluidos.
    pub fn with_defaults(store: SegmentStore) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ConvertToRawIndexExecutor::new(store)));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(executor.task_type(), executor);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn execute(&self, spec: &SubTaskSpec) -> Result<ConversionOutcome> {
        let executor = self
            .get(spec.task_type)
            .ok_or_else(|| anyhow!("no hay executor registrado para {}", spec.task_type))?;
        executor.execute(spec)
    }
}
