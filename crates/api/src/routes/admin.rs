//! Admin routes, mounted at `/admin`. Every handler requires the admin role.
//!
//! ```text
//! POST   /emergency-stop          engage_emergency_stop
//! DELETE /emergency-stop          release_emergency_stop
//! GET    /targets                 list_targets
//! POST   /targets                 add_target
//! DELETE /targets/{id}            remove_target
//! GET    /users/{user_id}/quotas  get_quota
//! PUT    /users/{user_id}/quotas  update_quota
//! GET    /audit-logs              list_audit_logs
//! ```

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::admin;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/emergency-stop",
            post(admin::engage_emergency_stop).delete(admin::release_emergency_stop),
        )
        .route("/targets", get(admin::list_targets).post(admin::add_target))
        .route("/targets/{id}", delete(admin::remove_target))
        .route(
            "/users/{user_id}/quotas",
            get(admin::get_quota).put(admin::update_quota),
        )
        .route("/audit-logs", get(admin::list_audit_logs))
}
