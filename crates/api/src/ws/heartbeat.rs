use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::ws::manager::WsManager;

/// Spawn a background task that pings every connected client each
/// `interval` and drops connections silent for longer than `timeout`.
pub fn start_heartbeat(
    ws_manager: Arc<WsManager>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Heartbeat task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = ws_manager.reap_stale(timeout).await;
                    let count = ws_manager.connection_count().await;
                    tracing::debug!(count, reaped = reaped.len(), "WebSocket heartbeat ping");
                    ws_manager.ping_all().await;
                }
            }
        }
    })
}
