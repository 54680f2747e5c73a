//! The orchestration facade exposed to the HTTP and WebSocket layers.
//!
//! Wires the admission pipeline, registry, supervisor, event bus and
//! collaborator stores together. Every entry point takes an already
//! resolved [`Identity`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use stormforge_core::admission::{AdmissionError, AdmissionPipeline};
use stormforge_core::command::CommandBuilder;
use stormforge_core::error::CoreError;
use stormforge_core::halt::{EmergencyStop, HaltState};
use stormforge_core::job::{JobSnapshot, JobSpec};
use stormforge_core::job_events::{
    AUDIT_EMERGENCY_STOP_ENGAGE, AUDIT_EMERGENCY_STOP_RELEASE, AUDIT_JOB_FORCE_STOP,
    AUDIT_JOB_STOP, AUDIT_JOB_SUBMIT, AUDIT_QUOTA_UPDATE, AUDIT_TARGET_LIST_ADD,
    AUDIT_TARGET_LIST_REMOVE, SYSTEM_EMERGENCY_STOP_ENGAGED, SYSTEM_EMERGENCY_STOP_RELEASED,
    SYSTEM_TARGET_POLICY_RELOADED,
};
use stormforge_core::quota::{GlobalLimits, QuotaGuard, QuotaLimits, QuotaUsage};
use stormforge_core::roles::Identity;
use stormforge_core::types::{DbId, JobId};
use stormforge_db::models::audit::{AuditLog, AuditQuery, NewAuditEntry};
use stormforge_db::models::target::{NewTargetEntry, TargetEntry};
use stormforge_db::{JobStore, QuotaStore, StoreError, TargetListStore};
use stormforge_events::{Event, EventBus, EventKind, Recorder, Scope, Subscription};
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::engine::policy::{PolicyCache, PolicyReload};
use crate::engine::registry::{JobEntry, JobFilter, JobRegistry, StopCause, StopSignal};
use crate::engine::supervisor::Supervisor;

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStopAck {
    /// `false` when the switch was already in the requested position.
    pub changed: bool,
    pub signalled_jobs: usize,
    pub state: HaltState,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GlobalUsage {
    pub running_jobs: u32,
    pub reserved_pps: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub emergency_stop: HaltState,
    pub active_jobs: usize,
    pub jobs_by_status: BTreeMap<&'static str, usize>,
    pub subscribers: usize,
    pub evicted_subscribers: u64,
    pub global_usage: GlobalUsage,
    pub global_limits: GlobalLimits,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaView {
    pub user_id: DbId,
    pub limits: QuotaLimits,
    pub usage: QuotaUsage,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetLists {
    pub allow: Vec<TargetEntry>,
    pub deny: Vec<TargetEntry>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    supervisor: Arc<Supervisor>,
    admission: AdmissionPipeline,
    policy: PolicyCache,
    quota: Arc<QuotaGuard>,
    job_store: Arc<dyn JobStore>,
    quota_store: Arc<dyn QuotaStore>,
    halt: Arc<EmergencyStop>,
    bus: Arc<EventBus>,
    recorder: Recorder,
    tasks: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        config: &EngineConfig,
        bus: Arc<EventBus>,
        recorder: Recorder,
        job_store: Arc<dyn JobStore>,
        target_store: Arc<dyn TargetListStore>,
        quota_store: Arc<dyn QuotaStore>,
    ) -> Self {
        let quota = Arc::new(QuotaGuard::new(config.default_quota, config.global_limits));
        let halt = Arc::new(EmergencyStop::new());
        let registry = Arc::new(JobRegistry::new(
            Arc::clone(&bus),
            recorder.clone(),
            Arc::clone(&quota),
            config.output_tail_lines,
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            CommandBuilder::new(config.tool_path.clone()),
            Arc::clone(&halt),
            config.supervisor_settings(),
        ));

        Self {
            registry,
            supervisor,
            admission: AdmissionPipeline::new(
                Arc::clone(&quota),
                Arc::clone(&halt),
                config.max_hosts_per_job,
            ),
            policy: PolicyCache::new(target_store),
            quota,
            job_store,
            quota_store,
            halt,
            bus,
            recorder,
            tasks: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Load quota overrides and the target policy from the stores.
    pub async fn load(&self) -> Result<(), StoreError> {
        let overrides = self.quota_store.list_overrides().await?;
        let count = overrides.len();
        for o in overrides {
            self.quota.set_limits(o.user_id, o.limits);
        }
        tracing::info!(count, "Quota overrides loaded");
        self.refresh_policy().await?;
        Ok(())
    }

    // -- Jobs ---------------------------------------------------------------

    /// Admit a job and hand it to a supervisor. Rejections are returned
    /// verbatim and leave no trace in the registry.
    pub fn submit(&self, caller: &Identity, spec: JobSpec) -> Result<JobSnapshot, AdmissionError> {
        let policy = self.policy.current();
        let snapshot = self
            .admission
            .admit(caller, spec, &policy, |job| self.registry.insert(job))
            .inspect_err(|e| {
                tracing::info!(user_id = caller.user_id, error = %e, "Job submission rejected");
            })?;

        self.recorder.audit(
            NewAuditEntry::new(AUDIT_JOB_SUBMIT, "job")
                .with_user(caller.user_id)
                .with_resource_id(snapshot.id)
                .with_details(json!({
                    "name": snapshot.spec.name,
                    "traffic_type": snapshot.spec.traffic_type,
                    "targets": snapshot.spec.targets,
                    "pps": snapshot.spec.pps,
                    "dry_run": snapshot.spec.dry_run,
                })),
        );
        self.supervisor.launch(snapshot.id, &self.tasks);
        Ok(snapshot)
    }

    pub fn get(&self, viewer: &Identity, id: JobId) -> Result<JobSnapshot, CoreError> {
        Ok(self.visible_entry(viewer, id)?.detailed_snapshot())
    }

    /// Non-admins only ever see their own jobs, whatever the filter says.
    pub fn list(&self, viewer: &Identity, mut filter: JobFilter) -> Vec<JobSnapshot> {
        if !viewer.is_admin() {
            filter.owner_id = Some(viewer.user_id);
        }
        self.registry.list(&filter)
    }

    /// Ask a job's supervisor to stop it. Returns once the request is
    /// delivered; the terminal state arrives later as an event.
    pub fn stop(
        &self,
        caller: &Identity,
        id: JobId,
        force: bool,
        reason: Option<String>,
    ) -> Result<JobSnapshot, CoreError> {
        if !caller.role.can_operate() {
            return Err(CoreError::Forbidden("Operator role required to stop jobs".into()));
        }
        let entry = self.visible_entry(caller, id)?;
        let snapshot = self.registry.request_stop(
            &entry,
            StopSignal {
                force,
                cause: StopCause::User {
                    by: caller.user_id,
                    reason: reason.clone(),
                },
            },
        )?;

        tracing::info!(job_id = %id, user_id = caller.user_id, force, "Job stop requested");
        let action = if force { AUDIT_JOB_FORCE_STOP } else { AUDIT_JOB_STOP };
        self.recorder.audit(
            NewAuditEntry::new(action, "job")
                .with_user(caller.user_id)
                .with_resource_id(id)
                .with_details(json!({ "force": force, "reason": reason })),
        );
        Ok(snapshot)
    }

    fn visible_entry(&self, viewer: &Identity, id: JobId) -> Result<Arc<JobEntry>, CoreError> {
        let entry = self.registry.get(id).ok_or_else(|| CoreError::NotFound {
            entity: "Job",
            id: id.to_string(),
        })?;
        if !viewer.can_view(entry.owner_id()) {
            return Err(CoreError::Forbidden("Cannot access another user's job".into()));
        }
        Ok(entry)
    }

    // -- Subscriptions --------------------------------------------------------

    pub fn subscribe(&self, viewer: &Identity, scope: Scope) -> Result<Subscription, CoreError> {
        if let Scope::Job(id) = scope {
            self.visible_entry(viewer, id)?;
        }
        Ok(self.bus.subscribe(scope, *viewer))
    }

    // -- Emergency stop -------------------------------------------------------

    /// Refuse new admissions and force-stop every active job.
    pub fn engage_emergency_stop(&self, caller: &Identity) -> EmergencyStopAck {
        let changed = self.halt.engage(caller.user_id);
        let mut signalled_jobs = 0;

        if changed {
            signalled_jobs = self.stop_all(true, StopCause::Emergency);
            tracing::warn!(user_id = caller.user_id, signalled_jobs, "Emergency stop engaged");

            self.announce(
                EventKind::SystemEvent,
                json!({
                    "event": SYSTEM_EMERGENCY_STOP_ENGAGED,
                    "engaged_by": caller.user_id,
                    "signalled_jobs": signalled_jobs,
                }),
            );
            self.record_admin_action(
                caller,
                AUDIT_EMERGENCY_STOP_ENGAGE,
                "system",
                None,
                json!({ "signalled_jobs": signalled_jobs }),
            );
        }

        EmergencyStopAck {
            changed,
            signalled_jobs,
            state: self.halt.state(),
        }
    }

    /// Restore admissions. Jobs cancelled by the halt stay cancelled.
    pub fn release_emergency_stop(&self, caller: &Identity) -> EmergencyStopAck {
        let changed = self.halt.release();
        if changed {
            tracing::warn!(user_id = caller.user_id, "Emergency stop released");
            self.announce(
                EventKind::SystemEvent,
                json!({
                    "event": SYSTEM_EMERGENCY_STOP_RELEASED,
                    "released_by": caller.user_id,
                }),
            );
            self.record_admin_action(caller, AUDIT_EMERGENCY_STOP_RELEASE, "system", None, json!({}));
        }
        EmergencyStopAck {
            changed,
            signalled_jobs: 0,
            state: self.halt.state(),
        }
    }

    fn stop_all(&self, force: bool, cause: StopCause) -> usize {
        self.registry
            .active_ids()
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .filter(|entry| {
                self.registry
                    .request_stop(
                        entry,
                        StopSignal {
                            force,
                            cause: cause.clone(),
                        },
                    )
                    .is_ok()
            })
            .count()
    }

    // -- Status ---------------------------------------------------------------

    pub fn status(&self) -> SystemStatus {
        let counts = self.registry.counts_by_status();
        let active_jobs = counts
            .iter()
            .filter(|(status, _)| !status.is_terminal())
            .map(|(_, count)| count)
            .sum();
        let (running_jobs, reserved_pps) = self.quota.global_usage();

        SystemStatus {
            emergency_stop: self.halt.state(),
            active_jobs,
            jobs_by_status: counts
                .into_iter()
                .map(|(status, count)| (status.as_str(), count))
                .collect(),
            subscribers: self.bus.subscriber_count(),
            evicted_subscribers: self.bus.evicted_count(),
            global_usage: GlobalUsage {
                running_jobs,
                reserved_pps,
            },
            global_limits: self.quota.global_limits(),
        }
    }

    // -- Quotas ---------------------------------------------------------------

    pub fn quota_view(&self, user_id: DbId) -> QuotaView {
        QuotaView {
            user_id,
            limits: self.quota.limits_for(user_id),
            usage: self.quota.usage(user_id),
        }
    }

    /// Persist a per-user override, then apply it to future admissions.
    pub async fn set_quota(
        &self,
        caller: &Identity,
        user_id: DbId,
        limits: QuotaLimits,
    ) -> Result<QuotaView, StoreError> {
        self.quota_store.upsert_override(user_id, limits).await?;
        self.quota.set_limits(user_id, limits);
        tracing::info!(user_id, updated_by = caller.user_id, "Quota override updated");
        self.record_admin_action(
            caller,
            AUDIT_QUOTA_UPDATE,
            "user_quota",
            Some(user_id.to_string()),
            serde_json::to_value(limits).unwrap_or_default(),
        );
        Ok(self.quota_view(user_id))
    }

    // -- Target lists ---------------------------------------------------------

    pub async fn list_targets(&self) -> Result<TargetLists, StoreError> {
        let store = self.policy.store();
        Ok(TargetLists {
            allow: store.list_allow_entries().await?,
            deny: store.list_deny_entries().await?,
        })
    }

    pub async fn add_target(
        &self,
        caller: &Identity,
        entry: NewTargetEntry,
    ) -> Result<TargetEntry, StoreError> {
        let created = self.policy.store().add_entry(entry).await?;
        self.record_admin_action(
            caller,
            AUDIT_TARGET_LIST_ADD,
            "target_entry",
            Some(created.id.to_string()),
            json!({ "kind": created.kind, "cidr": created.cidr.to_string() }),
        );
        self.refresh_after_edit().await;
        Ok(created)
    }

    pub async fn remove_target(
        &self,
        caller: &Identity,
        id: DbId,
    ) -> Result<Option<TargetEntry>, StoreError> {
        let removed = self.policy.store().remove_entry(id).await?;
        if let Some(entry) = &removed {
            self.record_admin_action(
                caller,
                AUDIT_TARGET_LIST_REMOVE,
                "target_entry",
                Some(entry.id.to_string()),
                json!({ "kind": entry.kind, "cidr": entry.cidr.to_string() }),
            );
            self.refresh_after_edit().await;
        }
        Ok(removed)
    }

    /// Read back the audit trail. Entries still queued in the recorder are
    /// not visible yet.
    pub async fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditLog>, StoreError> {
        self.job_store.list_audit(query).await
    }

    /// Reload the cached target policy, announcing it when it changed.
    pub async fn refresh_policy(&self) -> Result<PolicyReload, StoreError> {
        let reload = self.policy.refresh().await?;
        if reload.changed {
            tracing::info!(
                allow_entries = reload.allow_entries,
                deny_entries = reload.deny_entries,
                "Target policy reloaded"
            );
            self.announce(
                EventKind::SystemEvent,
                json!({
                    "event": SYSTEM_TARGET_POLICY_RELOADED,
                    "allow_entries": reload.allow_entries,
                    "deny_entries": reload.deny_entries,
                }),
            );
        }
        Ok(reload)
    }

    async fn refresh_after_edit(&self) {
        if let Err(e) = self.refresh_policy().await {
            tracing::error!(error = %e, "Failed to reload target policy after edit");
        }
    }

    // -- Maintenance ----------------------------------------------------------

    /// Drop terminal jobs older than `retention`.
    pub fn sweep(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };
        self.registry.sweep(cutoff)
    }

    /// Force-stop everything still running and wait for supervisors to
    /// finish, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let signalled = self.stop_all(true, StopCause::Shutdown);
        tracing::info!(signalled, "Stopping active jobs for shutdown");
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Supervisors still running after shutdown timeout"
            );
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn announce(&self, kind: EventKind, data: serde_json::Value) {
        self.bus.publish(&Event::new(kind).with_data(data));
    }

    fn record_admin_action(
        &self,
        caller: &Identity,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        details: serde_json::Value,
    ) {
        self.announce(
            EventKind::AdminAction,
            json!({
                "action": action,
                "user_id": caller.user_id,
                "resource_type": resource_type,
                "resource_id": resource_id,
                "details": details,
            }),
        );

        let mut entry = NewAuditEntry::new(action, resource_type)
            .with_user(caller.user_id)
            .with_details(details);
        if let Some(id) = resource_id {
            entry = entry.with_resource_id(id);
        }
        self.recorder.audit(entry);
    }
}
