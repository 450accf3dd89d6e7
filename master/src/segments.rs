// master/src/segments.rs

use common::{SegmentError, StoreError, SyncSegmentsResponse};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::AppState;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registra en el metadata store los segmentos del disco que todavía no
/// están. Los que ya están no se tocan.
pub fn sync_segments(state: &AppState) -> Result<SyncSegmentsResponse, SyncError> {
    let on_disk = state.segments.scan()?;
    let scanned = on_disk.len();
    let mut registered = 0;

    for meta in on_disk {
        let name = format!("{}/{}", meta.table_name, meta.segment_name);
        if state.metadata.put_segment_if_absent(meta)? {
            debug!("segmento {} registrado", name);
            registered += 1;
        }
    }

    if registered > 0 {
        info!(
            "sync de segmentos: {} nuevos de {} en {}",
            registered,
            scanned,
            state.segments.root().display()
        );
    }
    Ok(SyncSegmentsResponse {
        registered,
        scanned,
    })
}
