//! Collaborator traits consumed by the engine, and their PostgreSQL
//! implementation.

use async_trait::async_trait;
use stormforge_core::job::JobSnapshot;
use stormforge_core::quota::QuotaLimits;
use stormforge_core::targets::ListKind;
use stormforge_core::types::DbId;

use crate::error::StoreError;
use crate::models::audit::{AuditLog, AuditQuery, NewAuditEntry};
use crate::models::quota::QuotaOverride;
use crate::models::target::{NewTargetEntry, TargetEntry};
use crate::repositories::{AuditLogRepo, JobSnapshotRepo, QuotaRepo, TargetEntryRepo};
use crate::DbPool;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Job snapshots and the audit trail. Writes are fire-and-forget from the
/// engine's point of view.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job_snapshot(&self, job: &JobSnapshot) -> Result<(), StoreError>;
    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), StoreError>;
    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLog>, StoreError>;
}

/// Source of the admin allow/deny lists.
#[async_trait]
pub trait TargetListStore: Send + Sync {
    async fn list_allow_entries(&self) -> Result<Vec<TargetEntry>, StoreError>;
    async fn list_deny_entries(&self) -> Result<Vec<TargetEntry>, StoreError>;
    async fn add_entry(&self, entry: NewTargetEntry) -> Result<TargetEntry, StoreError>;
    /// Returns the removed entry, or `None` if no entry had that id.
    async fn remove_entry(&self, id: DbId) -> Result<Option<TargetEntry>, StoreError>;
}

/// Per-user quota overrides.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn list_overrides(&self) -> Result<Vec<QuotaOverride>, StoreError>;
    async fn upsert_override(
        &self,
        user_id: DbId,
        limits: QuotaLimits,
    ) -> Result<QuotaOverride, StoreError>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn list_kind(&self, kind: ListKind) -> Result<Vec<TargetEntry>, StoreError> {
        TargetEntryRepo::list_by_kind(&self.pool, kind)
            .await?
            .into_iter()
            .map(TargetEntry::try_from)
            .collect()
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn save_job_snapshot(&self, job: &JobSnapshot) -> Result<(), StoreError> {
        JobSnapshotRepo::upsert(&self.pool, job).await?;
        Ok(())
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), StoreError> {
        AuditLogRepo::insert(&self.pool, entry).await?;
        Ok(())
    }

    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLog>, StoreError> {
        Ok(AuditLogRepo::list(&self.pool, query).await?)
    }
}

#[async_trait]
impl TargetListStore for PgStore {
    async fn list_allow_entries(&self) -> Result<Vec<TargetEntry>, StoreError> {
        self.list_kind(ListKind::Allow).await
    }

    async fn list_deny_entries(&self) -> Result<Vec<TargetEntry>, StoreError> {
        self.list_kind(ListKind::Deny).await
    }

    async fn add_entry(&self, entry: NewTargetEntry) -> Result<TargetEntry, StoreError> {
        TargetEntryRepo::create(&self.pool, &entry).await?.try_into()
    }

    async fn remove_entry(&self, id: DbId) -> Result<Option<TargetEntry>, StoreError> {
        TargetEntryRepo::delete(&self.pool, id)
            .await?
            .map(TargetEntry::try_from)
            .transpose()
    }
}

#[async_trait]
impl QuotaStore for PgStore {
    async fn list_overrides(&self) -> Result<Vec<QuotaOverride>, StoreError> {
        Ok(QuotaRepo::list(&self.pool)
            .await?
            .into_iter()
            .map(QuotaOverride::from)
            .collect())
    }

    async fn upsert_override(
        &self,
        user_id: DbId,
        limits: QuotaLimits,
    ) -> Result<QuotaOverride, StoreError> {
        Ok(QuotaRepo::upsert(&self.pool, user_id, &limits).await?.into())
    }
}
