//! Periodic eviction of finished jobs from the in-memory registry.
//!
//! Terminal jobs stay queryable for `retention` after completion; the
//! durable copy lives in the job store.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::Orchestrator;

/// Run the retention sweep loop until `cancel` is triggered.
pub async fn run(
    orchestrator: Arc<Orchestrator>,
    retention: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::info!(
        retention_secs = retention.as_secs(),
        interval_secs = interval.as_secs(),
        "Job retention sweep started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Job retention sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = orchestrator.sweep(retention);
                if removed > 0 {
                    tracing::info!(removed, "Job retention: evicted finished jobs");
                } else {
                    tracing::debug!("Job retention: nothing to evict");
                }
            }
        }
    }
}
