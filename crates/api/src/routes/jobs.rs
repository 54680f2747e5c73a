//! Job routes, mounted at `/jobs`.
//!
//! ```text
//! GET    /              list_jobs
//! POST   /              submit_job
//! GET    /{id}          get_job
//! POST   /{id}/stop     stop_job
//! ```

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::jobs;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(jobs::list_jobs).post(jobs::submit_job))
        .route("/{id}", get(jobs::get_job))
        .route("/{id}/stop", post(jobs::stop_job))
}
