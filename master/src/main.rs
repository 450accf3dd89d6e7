mod config;
mod failover;
mod handlers;
mod queue;
mod scheduler;
mod segments;
mod state;

use anyhow::{Context, Result};
use common::InMemoryMetadataStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{load_table_configs, MasterConfig};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("master=debug,tower_http=info")),
        )
        .init();

    let config = MasterConfig::from_env();
    let table_configs = match &config.task_config_path {
        Some(path) => load_table_configs(path)?,
        None => {
            warn!("TASK_CONFIG_PATH no definido: no hay tablas para optimizar");
            BTreeMap::new()
        }
    };
    info!(
        "segmentos en {}, lease de {:?}, scheduler cada {:?}",
        config.segment_dir.display(),
        config.lease_timeout,
        config.schedule_interval
    );

    let state = AppState::new(config, Arc::new(InMemoryMetadataStore::new()), table_configs);

    // registrar lo que ya hay en disco antes de atender workers
    match segments::sync_segments(&state) {
        Ok(r) => info!("{} segmentos registrados al arrancar", r.registered),
        Err(e) => warn!("sync inicial de segmentos falló: {}", e),
    }

    // router HTTP
    let app = handlers::build_router(state.clone());

    // scheduler en segundo plano
    let scheduler_state = state.clone();
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler_state).await;
    });

    // vencimiento de leases en segundo plano
    let sweep_state = state.clone();
    tokio::spawn(async move {
        failover::run_lease_sweep_loop(sweep_state).await;
    });

    let listener = TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", state.config.bind_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
