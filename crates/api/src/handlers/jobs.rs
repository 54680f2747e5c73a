//! Handlers for job submission, inspection and stop requests.

use std::collections::HashSet;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use stormforge_core::job::{JobSpec, JobStatus};
use stormforge_core::types::{DbId, JobId};

use crate::engine::registry::JobFilter;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthUser;
use crate::middleware::rbac::RequireOperator;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query / request types
// ---------------------------------------------------------------------------

/// Query parameters for `GET /jobs`.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    /// Comma-separated status names, e.g. `running,admitted`.
    pub status: Option<String>,
    pub tag: Option<String>,
    /// Honoured for admins only.
    pub owner_id: Option<DbId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsParams {
    fn into_filter(self) -> AppResult<JobFilter> {
        let statuses = match self.status.as_deref() {
            None | Some("") => None,
            Some(csv) => Some(
                csv.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        JobStatus::from_name(s)
                            .ok_or_else(|| AppError::BadRequest(format!("Unknown job status '{s}'")))
                    })
                    .collect::<AppResult<HashSet<_>>>()?,
            ),
        };
        Ok(JobFilter {
            owner_id: self.owner_id,
            statuses,
            tag: self.tag,
            limit: self.limit,
            offset: self.offset.unwrap_or(0),
        })
    }
}

/// Body for `POST /jobs/{id}/stop`. An empty body requests a graceful stop.
#[derive(Debug, Default, Deserialize)]
pub struct StopJobRequest {
    #[serde(default)]
    pub force: bool,
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
pub async fn list_jobs(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> AppResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    let jobs = state.orchestrator.list(&auth.identity(), filter);
    Ok(Json(DataResponse { data: jobs }))
}

/// POST /api/v1/jobs
///
/// Validation, target policy, emergency stop and quota checks all happen
/// before anything is registered.
pub async fn submit_job(
    RequireOperator(auth): RequireOperator,
    State(state): State<AppState>,
    Json(spec): Json<JobSpec>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.orchestrator.submit(&auth.identity(), spec)?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: snapshot })))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.orchestrator.get(&auth.identity(), id)?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// POST /api/v1/jobs/{id}/stop
///
/// Returns 202: the stop is delivered to the job's supervisor and the
/// terminal state follows as an event.
pub async fn stop_job(
    RequireOperator(auth): RequireOperator,
    State(state): State<AppState>,
    Path(id): Path<JobId>,
    body: Option<Json<StopJobRequest>>,
) -> AppResult<impl IntoResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let snapshot = state
        .orchestrator
        .stop(&auth.identity(), id, req.force, req.reason)?;
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: snapshot })))
}
