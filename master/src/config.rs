// master/src/config.rs

use anyhow::{Context, Result};
use common::{TableName, TableTaskConfig};
use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf, time::Duration};
use tracing::info;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SEGMENT_DIR: &str = "/data/segments";
pub const DEFAULT_SCHEDULE_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LEASE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_LEASE_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_FINISHED_TASK_RETENTION_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_addr: String,
    pub segment_dir: PathBuf,
    pub task_config_path: Option<PathBuf>,
    pub schedule_interval: Duration,
    /// Presupuesto de ejecución de una sub-tarea.
    pub lease_timeout: Duration,
    pub lease_sweep_interval: Duration,
    /// Espera antes de volver a agrupar segmentos de tareas FAILED/TIMED_OUT.
    pub failed_rebatch_cooldown: Duration,
    pub finished_task_retention: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            segment_dir: PathBuf::from(DEFAULT_SEGMENT_DIR),
            task_config_path: None,
            schedule_interval: Duration::from_secs(DEFAULT_SCHEDULE_INTERVAL_SECS),
            lease_timeout: Duration::from_secs(DEFAULT_LEASE_TIMEOUT_SECS),
            lease_sweep_interval: Duration::from_secs(DEFAULT_LEASE_SWEEP_INTERVAL_SECS),
            failed_rebatch_cooldown: Duration::ZERO,
            finished_task_retention: Duration::from_secs(DEFAULT_FINISHED_TASK_RETENTION_SECS),
        }
    }
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default),
    )
}

impl MasterConfig {
    /// Lee la configuración de variables de entorno; lo que falte usa el default.
    pub fn from_env() -> Self {
        let mut cfg = Self {
            bind_addr: env::var("MASTER_BIND_ADDR")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            segment_dir: env::var("SEGMENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SEGMENT_DIR)),
            task_config_path: env::var("TASK_CONFIG_PATH").ok().map(PathBuf::from),
            schedule_interval: env_secs("SCHEDULE_INTERVAL_SECS", DEFAULT_SCHEDULE_INTERVAL_SECS),
            lease_timeout: env_secs("LEASE_TIMEOUT_SECS", DEFAULT_LEASE_TIMEOUT_SECS),
            lease_sweep_interval: env_secs(
                "LEASE_SWEEP_INTERVAL_SECS",
                DEFAULT_LEASE_SWEEP_INTERVAL_SECS,
            ),
            failed_rebatch_cooldown: env_secs("FAILED_REBATCH_COOLDOWN_SECS", 0),
            finished_task_retention: env_secs(
                "FINISHED_TASK_RETENTION_SECS",
                DEFAULT_FINISHED_TASK_RETENTION_SECS,
            ),
        };

        // el cooldown mira tareas terminadas: no se pueden olvidar antes
        if cfg.finished_task_retention < cfg.failed_rebatch_cooldown {
            cfg.finished_task_retention = cfg.failed_rebatch_cooldown;
        }
        cfg
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout).unwrap_or(chrono::Duration::MAX)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.failed_rebatch_cooldown).unwrap_or(chrono::Duration::MAX)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.finished_task_retention).unwrap_or(chrono::Duration::MAX)
    }
}

/// Configuración de tareas por tabla:
///
/// ```json
/// { "airlines": { "ConvertToRawIndexTask": { "tableMaxNumTasks": "5", "columnsToConvert": "ArrDelay" } } }
/// ```
pub fn load_table_configs(path: &Path) -> Result<BTreeMap<TableName, TableTaskConfig>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("leyendo configuración de tareas {}", path.display()))?;
    let configs: BTreeMap<TableName, TableTaskConfig> = serde_json::from_str(&raw)
        .with_context(|| format!("parseando configuración de tareas {}", path.display()))?;

    info!(
        "configuración de tareas cargada de {}: {} tablas",
        path.display(),
        configs.len()
    );
    Ok(configs)
}
