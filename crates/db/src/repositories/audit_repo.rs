//! Repository for the `audit_logs` table.

use sqlx::PgPool;

use crate::models::audit::{AuditLog, AuditQuery, NewAuditEntry};

/// Column list for `audit_logs` SELECT queries.
const COLUMNS: &str = "id, user_id, action, resource_type, resource_id, details, created_at";

pub struct AuditLogRepo;

impl AuditLogRepo {
    pub async fn insert(pool: &PgPool, entry: &NewAuditEntry) -> Result<AuditLog, sqlx::Error> {
        let query = format!(
            "INSERT INTO audit_logs (user_id, action, resource_type, resource_id, details) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AuditLog>(&query)
            .bind(entry.user_id)
            .bind(&entry.action)
            .bind(&entry.resource_type)
            .bind(&entry.resource_id)
            .bind(&entry.details)
            .fetch_one(pool)
            .await
    }

    /// Filtered page of the audit trail, newest first. Unset filters match
    /// everything.
    pub async fn list(pool: &PgPool, params: &AuditQuery) -> Result<Vec<AuditLog>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM audit_logs \
             WHERE ($1::BIGINT IS NULL OR user_id = $1) \
               AND ($2::TEXT IS NULL OR action = $2) \
               AND ($3::TEXT IS NULL OR resource_type = $3) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $4 OFFSET $5"
        );
        sqlx::query_as::<_, AuditLog>(&query)
            .bind(params.user_id)
            .bind(&params.action)
            .bind(&params.resource_type)
            .bind(params.limit())
            .bind(params.offset())
            .fetch_all(pool)
            .await
    }
}
