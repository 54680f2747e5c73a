//! Repository for the `user_quotas` table.

use sqlx::PgPool;
use stormforge_core::quota::QuotaLimits;
use stormforge_core::types::DbId;

use crate::models::quota::QuotaOverrideRow;

/// Column list for `user_quotas` SELECT queries.
const COLUMNS: &str = "\
    user_id, max_concurrent_jobs, pps_budget, max_submissions, \
    rate_window_secs, max_job_duration_secs, updated_at";

pub struct QuotaRepo;

impl QuotaRepo {
    pub async fn list(pool: &PgPool) -> Result<Vec<QuotaOverrideRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM user_quotas ORDER BY user_id");
        sqlx::query_as::<_, QuotaOverrideRow>(&query)
            .fetch_all(pool)
            .await
    }

    pub async fn upsert(
        pool: &PgPool,
        user_id: DbId,
        limits: &QuotaLimits,
    ) -> Result<QuotaOverrideRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO user_quotas \
                (user_id, max_concurrent_jobs, pps_budget, max_submissions, \
                 rate_window_secs, max_job_duration_secs, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, NOW()) \
             ON CONFLICT (user_id) DO UPDATE SET \
                max_concurrent_jobs = EXCLUDED.max_concurrent_jobs, \
                pps_budget = EXCLUDED.pps_budget, \
                max_submissions = EXCLUDED.max_submissions, \
                rate_window_secs = EXCLUDED.rate_window_secs, \
                max_job_duration_secs = EXCLUDED.max_job_duration_secs, \
                updated_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QuotaOverrideRow>(&query)
            .bind(user_id)
            .bind(limits.max_concurrent_jobs as i32)
            .bind(limits.pps_budget as i64)
            .bind(limits.max_submissions as i32)
            .bind(limits.rate_window_secs as i64)
            .bind(limits.max_job_duration_secs as i64)
            .fetch_one(pool)
            .await
    }
}
