use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::queue::SweepSummary;
use crate::state::{AppState, PoisonedLock};

/// Loop de tolerancia a fallos: vence leases de workers que no reportaron a
/// tiempo. La primera vez la sub-tarea vuelve a la cola; la segunda se pierde
/// y la tarea termina TIMED_OUT.
pub async fn run_lease_sweep_loop(state: AppState) {
    loop {
        sleep(state.config.lease_sweep_interval).await;

        if let Err(e) = sweep_once(&state) {
            warn!("error en lease sweep: {}", e);
        }
    }
}

fn sweep_once(state: &AppState) -> Result<SweepSummary, PoisonedLock> {
    let summary = state.lock_queues()?.sweep_expired_leases(Utc::now());

    if summary != SweepSummary::default() {
        info!(
            "lease sweep: {} re-entregadas, {} perdidas, {} canceladas",
            summary.redelivered, summary.lost, summary.cancelled
        );
    }
    Ok(summary)
}
