use axum::routing::get;
use axum::Router;

use crate::handlers::system;
use crate::state::AppState;

/// System routes, mounted at `/system`.
pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(system::get_status))
}
