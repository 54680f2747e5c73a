//! Periodic reload of the target allow/deny lists.
//!
//! Admin edits through the API refresh the policy immediately; this loop
//! picks up changes made directly in the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::Orchestrator;

/// Run the policy refresh loop until `cancel` is triggered. Store errors
/// keep the last good policy in place.
pub async fn run(orchestrator: Arc<Orchestrator>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Target policy refresh started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; startup already loaded the policy.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Target policy refresh stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = orchestrator.refresh_policy().await {
                    tracing::error!(error = %e, "Target policy refresh failed, keeping previous policy");
                }
            }
        }
    }
}
