//! Handlers for system-wide status.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::engine::orchestrator::SystemStatus;
use crate::error::AppResult;
use crate::middleware::auth::AuthUser;
use crate::response::DataResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SystemStatsResponse {
    #[serde(flatten)]
    pub status: SystemStatus,
    pub websocket_connections: usize,
}

/// Engine status plus live WebSocket connection count. Shared with the
/// `request_stats` WebSocket message.
pub async fn system_stats(state: &AppState) -> SystemStatsResponse {
    SystemStatsResponse {
        status: state.orchestrator.status(),
        websocket_connections: state.ws_manager.connection_count().await,
    }
}

/// GET /api/v1/system/status
pub async fn get_status(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: system_stats(&state).await,
    }))
}
