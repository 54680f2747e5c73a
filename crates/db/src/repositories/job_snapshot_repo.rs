//! Repository for the `job_snapshots` table.
//!
//! One row per job, overwritten on every state change. The full parameter
//! set is kept as JSONB; the columns used for filtering are lifted out.

use sqlx::PgPool;
use stormforge_core::job::JobSnapshot;

pub struct JobSnapshotRepo;

impl JobSnapshotRepo {
    /// Insert or replace the snapshot for `job.id`.
    ///
    /// Rows only move forward: an older `seq` never overwrites a newer one.
    pub async fn upsert(pool: &PgPool, job: &JobSnapshot) -> Result<(), sqlx::Error> {
        let spec = serde_json::to_value(&job.spec)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        sqlx::query(
            "INSERT INTO job_snapshots \
                (job_id, owner_id, name, status, traffic_type, spec, hosts, seq, \
                 packets_sent, bytes_sent, output_lines, error_message, cancel_reason, \
                 created_at, started_at, completed_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW()) \
             ON CONFLICT (job_id) DO UPDATE SET \
                status = EXCLUDED.status, \
                seq = EXCLUDED.seq, \
                packets_sent = EXCLUDED.packets_sent, \
                bytes_sent = EXCLUDED.bytes_sent, \
                output_lines = EXCLUDED.output_lines, \
                error_message = EXCLUDED.error_message, \
                cancel_reason = EXCLUDED.cancel_reason, \
                started_at = EXCLUDED.started_at, \
                completed_at = EXCLUDED.completed_at, \
                updated_at = NOW() \
             WHERE job_snapshots.seq <= EXCLUDED.seq",
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(&job.spec.name)
        .bind(job.status.as_str())
        .bind(job.spec.traffic_type.as_str())
        .bind(spec)
        .bind(&job.hosts)
        .bind(job.seq as i64)
        .bind(job.counters.packets_sent as i64)
        .bind(job.counters.bytes_sent as i64)
        .bind(job.counters.output_lines as i64)
        .bind(&job.error_message)
        .bind(&job.cancel_reason)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }
}
