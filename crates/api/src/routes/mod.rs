pub mod admin;
pub mod health;
pub mod jobs;
pub mod system;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws/monitor                  WebSocket, global events (role filtered)
/// /ws/jobs/{id}                WebSocket, events for one job
/// /jobs                        submit, list, inspect, stop
/// /system                      engine status
/// /admin                       emergency stop, target lists, quotas
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws/monitor", get(ws::monitor_ws_handler))
        .route("/ws/jobs/{id}", get(ws::job_ws_handler))
        .nest("/jobs", jobs::router())
        .nest("/system", system::router())
        .nest("/admin", admin::router())
}
