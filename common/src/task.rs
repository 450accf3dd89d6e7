use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::metadata::{SegmentName, TableName, OPTIMIZATION_RAW_INDEX};

pub type TaskId = String;

/// Claves reconocidas en la configuración de un tipo de tarea.
pub const TABLE_MAX_NUM_TASKS_KEY: &str = "tableMaxNumTasks";
pub const COLUMNS_TO_CONVERT_KEY: &str = "columnsToConvert";

/// Tope de segmentos por tarea cuando la tabla no lo configura.
pub const DEFAULT_TABLE_MAX_NUM_TASKS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tipo de tarea desconocido: {0}")]
    UnknownTaskType(String),

    #[error("falta la clave {0}")]
    MissingKey(&'static str),

    #[error("valor inválido para {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Tipos de tarea soportados. Cada uno tiene su executor registrado aparte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskType {
    ConvertToRawIndexTask,
}

impl TaskType {
    pub const ALL: [TaskType; 1] = [TaskType::ConvertToRawIndexTask];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ConvertToRawIndexTask => "ConvertToRawIndexTask",
        }
    }

    /// Tag que queda en la metadata del segmento cuando la tarea se aplicó.
    pub fn optimization_tag(&self) -> &'static str {
        match self {
            TaskType::ConvertToRawIndexTask => OPTIMIZATION_RAW_INDEX,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownTaskType(s.to_string()))
    }
}

/// Bolsa plana de parámetros de un tipo de tarea para una tabla.
pub type TaskTypeConfig = HashMap<String, String>;

/// Configuración de tareas de una tabla: tipo -> parámetros.
pub type TableTaskConfig = BTreeMap<TaskType, TaskTypeConfig>;

/// Parámetros ya validados de ConvertToRawIndexTask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertToRawIndexParams {
    pub max_tasks_per_batch: usize,
    pub columns: Vec<String>,
}

impl ConvertToRawIndexParams {
    pub fn from_config(config: &TaskTypeConfig) -> Result<Self, ConfigError> {
        let max_tasks_per_batch = match config.get(TABLE_MAX_NUM_TASKS_KEY) {
            None => DEFAULT_TABLE_MAX_NUM_TASKS,
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: TABLE_MAX_NUM_TASKS_KEY,
                        value: raw.clone(),
                    })
                }
            },
        };

        let raw_columns = config
            .get(COLUMNS_TO_CONVERT_KEY)
            .ok_or(ConfigError::MissingKey(COLUMNS_TO_CONVERT_KEY))?;
        let columns: Vec<String> = raw_columns
            .split(',')
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .collect();
        if columns.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: COLUMNS_TO_CONVERT_KEY,
                value: raw_columns.clone(),
            });
        }

        Ok(Self {
            max_tasks_per_batch,
            columns,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Aborted,
    TimedOut,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted | TaskState::TimedOut
        )
    }
}

pub fn task_id(task_type: TaskType, generation: u64) -> TaskId {
    format!("Task_{}_{}", task_type, generation)
}

/// Una unidad de trabajo tal como la recibe un worker: un segmento y las
/// columnas a convertir dentro de una tarea.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskSpec {
    pub task_id: TaskId,
    pub index: usize,
    pub task_type: TaskType,
    pub table: TableName,
    pub segment: SegmentName,
    pub columns: Vec<String>,
    /// 1 en la primera entrega, 2 en la re-entrega tras timeout.
    pub attempt: u32,
}
