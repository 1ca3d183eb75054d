use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::store::StoreResult;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL if at least `threshold` records were appended since the
/// last compaction. Returns whether it did.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> StoreResult<bool> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!(appends, "compacted WAL");
    Ok(true)
}

/// Background task that periodically compacts the WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        match compact_if_needed(&engine, threshold).await {
            Ok(true) => {}
            Ok(false) => debug!("compactor: below threshold {threshold}"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
