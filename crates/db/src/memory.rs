//! In-process implementation of every store trait.
//!
//! Used when no `DATABASE_URL` is configured and throughout the test
//! suites. Writes can be made to fail on demand to exercise the engine's
//! best-effort persistence path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use stormforge_core::job::JobSnapshot;
use stormforge_core::quota::QuotaLimits;
use stormforge_core::sync::lock;
use stormforge_core::targets::ListKind;
use stormforge_core::types::{DbId, JobId};

use crate::error::StoreError;
use crate::models::audit::{AuditLog, AuditQuery, NewAuditEntry};
use crate::models::quota::QuotaOverride;
use crate::models::target::{NewTargetEntry, TargetEntry};
use crate::store::{JobStore, QuotaStore, TargetListStore};

#[derive(Debug, Default)]
struct Inner {
    snapshots: HashMap<JobId, JobSnapshot>,
    audit: Vec<AuditLog>,
    targets: Vec<TargetEntry>,
    next_target_id: DbId,
    quotas: HashMap<DbId, QuotaOverride>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent job/audit write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        } else {
            Ok(())
        }
    }

    pub fn snapshot(&self, id: JobId) -> Option<JobSnapshot> {
        lock(&self.inner).snapshots.get(&id).cloned()
    }

    /// Every audit entry written so far, oldest first.
    pub fn audit_entries(&self) -> Vec<NewAuditEntry> {
        lock(&self.inner)
            .audit
            .iter()
            .map(|log| NewAuditEntry {
                user_id: log.user_id,
                action: log.action.clone(),
                resource_type: log.resource_type.clone(),
                resource_id: log.resource_id.clone(),
                details: log.details.clone(),
            })
            .collect()
    }

    fn list_kind(&self, kind: ListKind) -> Vec<TargetEntry> {
        lock(&self.inner)
            .targets
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job_snapshot(&self, job: &JobSnapshot) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        let newer = inner
            .snapshots
            .get(&job.id)
            .map_or(true, |existing| existing.seq <= job.seq);
        if newer {
            inner.snapshots.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &NewAuditEntry) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = lock(&self.inner);
        let id = inner.audit.len() as DbId + 1;
        inner.audit.push(AuditLog {
            id,
            user_id: entry.user_id,
            action: entry.action.clone(),
            resource_type: entry.resource_type.clone(),
            resource_id: entry.resource_id.clone(),
            details: entry.details.clone(),
            created_at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLog>, StoreError> {
        let inner = lock(&self.inner);
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|log| query.matches(log))
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TargetListStore for MemoryStore {
    async fn list_allow_entries(&self) -> Result<Vec<TargetEntry>, StoreError> {
        Ok(self.list_kind(ListKind::Allow))
    }

    async fn list_deny_entries(&self) -> Result<Vec<TargetEntry>, StoreError> {
        Ok(self.list_kind(ListKind::Deny))
    }

    async fn add_entry(&self, entry: NewTargetEntry) -> Result<TargetEntry, StoreError> {
        let mut inner = lock(&self.inner);
        inner.next_target_id += 1;
        let stored = TargetEntry {
            id: inner.next_target_id,
            kind: entry.kind,
            cidr: entry.cidr,
            description: entry.description,
            created_by: entry.created_by,
            created_at: chrono::Utc::now(),
        };
        inner.targets.push(stored.clone());
        Ok(stored)
    }

    async fn remove_entry(&self, id: DbId) -> Result<Option<TargetEntry>, StoreError> {
        let mut inner = lock(&self.inner);
        let position = inner.targets.iter().position(|e| e.id == id);
        Ok(position.map(|i| inner.targets.remove(i)))
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn list_overrides(&self) -> Result<Vec<QuotaOverride>, StoreError> {
        let mut overrides: Vec<_> = lock(&self.inner).quotas.values().cloned().collect();
        overrides.sort_by_key(|o| o.user_id);
        Ok(overrides)
    }

    async fn upsert_override(
        &self,
        user_id: DbId,
        limits: QuotaLimits,
    ) -> Result<QuotaOverride, StoreError> {
        let stored = QuotaOverride {
            user_id,
            limits,
            updated_at: chrono::Utc::now(),
        };
        lock(&self.inner).quotas.insert(user_id, stored.clone());
        Ok(stored)
    }
}
