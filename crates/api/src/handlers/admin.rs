//! Admin-only handlers: emergency stop, target lists, user quotas and the
//! audit trail.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use stormforge_core::error::CoreError;
use stormforge_core::quota::QuotaLimits;
use stormforge_core::targets::{parse_target, ListKind};
use stormforge_core::types::DbId;
use stormforge_db::models::audit::AuditQuery;
use stormforge_db::models::target::NewTargetEntry;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::middleware::rbac::RequireAdmin;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AddTargetRequest {
    pub kind: ListKind,
    /// Address or CIDR. Host bits are normalised away.
    pub cidr: String,
    pub description: Option<String>,
}

/// Full replacement of a user's quota override.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateQuotaRequest {
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub max_concurrent_jobs: u32,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub pps_budget: u64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub max_submissions: u32,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub rate_window_secs: u64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub max_job_duration_secs: u64,
}

impl From<UpdateQuotaRequest> for QuotaLimits {
    fn from(req: UpdateQuotaRequest) -> Self {
        QuotaLimits {
            max_concurrent_jobs: req.max_concurrent_jobs,
            pps_budget: req.pps_budget,
            max_submissions: req.max_submissions,
            rate_window_secs: req.rate_window_secs,
            max_job_duration_secs: req.max_job_duration_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Emergency stop
// ---------------------------------------------------------------------------

/// POST /api/v1/admin/emergency-stop
pub async fn engage_emergency_stop(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let ack = state.orchestrator.engage_emergency_stop(&admin.identity());
    Ok(Json(DataResponse { data: ack }))
}

/// DELETE /api/v1/admin/emergency-stop
pub async fn release_emergency_stop(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let ack = state.orchestrator.release_emergency_stop(&admin.identity());
    Ok(Json(DataResponse { data: ack }))
}

// ---------------------------------------------------------------------------
// Target lists
// ---------------------------------------------------------------------------

/// GET /api/v1/admin/targets
pub async fn list_targets(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let lists = state.orchestrator.list_targets().await?;
    Ok(Json(DataResponse { data: lists }))
}

/// POST /api/v1/admin/targets
pub async fn add_target(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
    Json(input): Json<AddTargetRequest>,
) -> AppResult<impl IntoResponse> {
    let cidr = parse_target(&input.cidr).map_err(AppError::BadRequest)?;
    let created = state
        .orchestrator
        .add_target(
            &admin.identity(),
            NewTargetEntry {
                kind: input.kind,
                cidr,
                description: input.description,
                created_by: Some(admin.user_id),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: created })))
}

/// DELETE /api/v1/admin/targets/{id}
pub async fn remove_target(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    state
        .orchestrator
        .remove_target(&admin.identity(), id)
        .await?
        .ok_or_else(|| CoreError::NotFound {
            entity: "TargetEntry",
            id: id.to_string(),
        })?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Quotas
// ---------------------------------------------------------------------------

/// GET /api/v1/admin/users/{user_id}/quotas
pub async fn get_quota(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState>,
    Path(user_id): Path<DbId>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(DataResponse {
        data: state.orchestrator.quota_view(user_id),
    }))
}

/// PUT /api/v1/admin/users/{user_id}/quotas
pub async fn update_quota(
    RequireAdmin(admin): RequireAdmin,
    State(state): State<AppState>,
    Path(user_id): Path<DbId>,
    Json(input): Json<UpdateQuotaRequest>,
) -> AppResult<impl IntoResponse> {
    input
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;
    let view = state
        .orchestrator
        .set_quota(&admin.identity(), user_id, input.into())
        .await?;
    Ok(Json(DataResponse { data: view }))
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

/// GET /api/v1/admin/audit-logs
///
/// Filters: `user_id`, `action`, `resource_type`; paged with `limit`
/// (default 100, max 500) and `offset`. Newest first.
pub async fn list_audit_logs(
    RequireAdmin(_admin): RequireAdmin,
    State(state): State<AppState>,
    Query(params): Query<AuditQuery>,
) -> AppResult<impl IntoResponse> {
    let logs = state.orchestrator.list_audit(&params).await?;
    Ok(Json(DataResponse { data: logs }))
}
