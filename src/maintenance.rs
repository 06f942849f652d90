use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::engine::Engine;
use crate::model::now_ms;
use crate::store::MemoryStore;

/// Compact the WAL whenever enough appends have piled up since the last
/// compaction. Checked every 30 seconds.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Periodically revoke API tokens past their validity.
pub async fn run_token_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.sweep_expired_tokens(now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!("revoked {n} expired tokens"),
            Err(e) => error!("token sweep failed: {e}"),
        }
    }
}
