use std::sync::Arc;

use crate::config::{EngineConfig, ServerConfig};
use crate::engine::Orchestrator;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub engine_config: Arc<EngineConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub ws_manager: Arc<WsManager>,
    /// Present when running against PostgreSQL; used by the health check.
    pub pool: Option<stormforge_db::DbPool>,
}
