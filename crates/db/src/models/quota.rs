//! Per-user quota overrides.

use serde::Serialize;
use sqlx::FromRow;
use stormforge_core::quota::QuotaLimits;
use stormforge_core::types::{DbId, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaOverride {
    pub user_id: DbId,
    pub limits: QuotaLimits,
    pub updated_at: Timestamp,
}

/// Raw `user_quotas` row (Postgres has no unsigned integers).
#[derive(Debug, Clone, FromRow)]
pub struct QuotaOverrideRow {
    pub user_id: DbId,
    pub max_concurrent_jobs: i32,
    pub pps_budget: i64,
    pub max_submissions: i32,
    pub rate_window_secs: i64,
    pub max_job_duration_secs: i64,
    pub updated_at: Timestamp,
}

impl From<QuotaOverrideRow> for QuotaOverride {
    fn from(row: QuotaOverrideRow) -> Self {
        Self {
            user_id: row.user_id,
            limits: QuotaLimits {
                max_concurrent_jobs: row.max_concurrent_jobs.max(0) as u32,
                pps_budget: row.pps_budget.max(0) as u64,
                max_submissions: row.max_submissions.max(0) as u32,
                rate_window_secs: row.rate_window_secs.max(0) as u64,
                max_job_duration_secs: row.max_job_duration_secs.max(0) as u64,
            },
            updated_at: row.updated_at,
        }
    }
}
