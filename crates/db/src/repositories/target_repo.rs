//! Repository for the `target_entries` table.

use sqlx::PgPool;
use stormforge_core::targets::ListKind;
use stormforge_core::types::DbId;

use crate::models::target::{NewTargetEntry, TargetEntryRow};

/// Column list for `target_entries` SELECT queries.
const COLUMNS: &str = "id, kind, cidr, description, created_by, created_at";

pub struct TargetEntryRepo;

impl TargetEntryRepo {
    pub async fn list_by_kind(pool: &PgPool, kind: ListKind) -> Result<Vec<TargetEntryRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM target_entries WHERE kind = $1 ORDER BY id");
        sqlx::query_as::<_, TargetEntryRow>(&query)
            .bind(kind.as_str())
            .fetch_all(pool)
            .await
    }

    pub async fn create(pool: &PgPool, entry: &NewTargetEntry) -> Result<TargetEntryRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO target_entries (kind, cidr, description, created_by) \
             VALUES ($1, $2, $3, $4) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, TargetEntryRow>(&query)
            .bind(entry.kind.as_str())
            .bind(entry.cidr.to_string())
            .bind(&entry.description)
            .bind(entry.created_by)
            .fetch_one(pool)
            .await
    }

    /// Delete by id, returning the removed row.
    pub async fn delete(pool: &PgPool, id: DbId) -> Result<Option<TargetEntryRow>, sqlx::Error> {
        let query = format!("DELETE FROM target_entries WHERE id = $1 RETURNING {COLUMNS}");
        sqlx::query_as::<_, TargetEntryRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
