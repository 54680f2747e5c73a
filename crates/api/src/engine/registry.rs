//! In-memory job registry: the single source of truth for job state.
//!
//! The map itself sits behind an `RwLock` that is only held long enough to
//! find or insert an entry; each job then has its own `Mutex`, so unrelated
//! jobs never contend. Every status change is published on the event bus
//! while the job's lock is still held, which keeps the registry and the last
//! published event in step and gives each job a single ordered event
//! stream.
//!
//! Lock order: quota (user, then global) -> registry map -> job entry ->
//! event bus. Quota is released only after the job lock has been dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use stormforge_core::error::CoreError;
use stormforge_core::job::{Job, JobSnapshot, JobStatus, TransitionError};
use stormforge_core::quota::QuotaGuard;
use stormforge_core::sync::{lock, read, write};
use stormforge_core::types::{DbId, JobId, Timestamp};
use stormforge_events::{Event, EventBus, Recorder};
use tokio::sync::mpsc;

/// Default and maximum page sizes for [`JobRegistry::list`].
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Stop signals
// ---------------------------------------------------------------------------

/// Why a job is being asked to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    User { by: DbId, reason: Option<String> },
    Emergency,
    Shutdown,
}

impl StopCause {
    pub fn describe(&self) -> String {
        match self {
            StopCause::User {
                reason: Some(reason),
                ..
            } => reason.clone(),
            StopCause::User { by, reason: None } => format!("stopped by user {by}"),
            StopCause::Emergency => "emergency stop".to_string(),
            StopCause::Shutdown => "server shutdown".to_string(),
        }
    }
}

/// Delivered to a job's supervisor over its control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopSignal {
    pub force: bool,
    pub cause: StopCause,
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

pub struct JobEntry {
    job: Mutex<Job>,
    control: mpsc::UnboundedSender<StopSignal>,
    /// Taken exactly once by the supervisor that runs the job.
    control_rx: Mutex<Option<mpsc::UnboundedReceiver<StopSignal>>>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        Self {
            job: Mutex::new(job),
            control,
            control_rx: Mutex::new(Some(control_rx)),
        }
    }

    pub fn id(&self) -> JobId {
        lock(&self.job).id
    }

    pub fn owner_id(&self) -> DbId {
        lock(&self.job).owner_id
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.job).status
    }

    pub fn snapshot(&self) -> JobSnapshot {
        lock(&self.job).snapshot()
    }

    pub fn detailed_snapshot(&self) -> JobSnapshot {
        lock(&self.job).detailed_snapshot()
    }

    /// Read a value out of the job under its lock.
    pub fn with_job<T>(&self, f: impl FnOnce(&Job) -> T) -> T {
        f(&lock(&self.job))
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner_id: Option<DbId>,
    pub statuses: Option<HashSet<JobStatus>>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if self.owner_id.is_some_and(|owner| owner != job.owner_id) {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !job.spec.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    bus: Arc<EventBus>,
    recorder: Recorder,
    quota: Arc<QuotaGuard>,
    output_tail_lines: usize,
}

impl JobRegistry {
    pub fn new(
        bus: Arc<EventBus>,
        recorder: Recorder,
        quota: Arc<QuotaGuard>,
        output_tail_lines: usize,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            bus,
            recorder,
            quota,
            output_tail_lines,
        }
    }

    /// Insert a freshly admitted job. Runs inside the admission commit, so
    /// the quota reservation and the registry insert are one step.
    pub fn insert(&self, mut job: Job) -> JobSnapshot {
        let now = Utc::now();
        if let Err(e) = job.transition(JobStatus::Admitted, now) {
            // A new job is always pending.
            tracing::error!(error = %e, job_id = %job.id, "New job was not pending");
        }
        job.seq += 1;
        let snapshot = job.snapshot();

        let id = job.id;
        let entry = Arc::new(JobEntry::new(job));
        {
            let mut jobs = write(&self.jobs);
            let _job = lock(&entry.job);
            jobs.insert(id, Arc::clone(&entry));
            self.bus.publish(&Event::job_status(&snapshot));
        }
        self.recorder.snapshot(snapshot.clone());
        tracing::info!(job_id = %id, owner_id = snapshot.owner_id, status = %snapshot.status, "Job admitted");
        snapshot
    }

    pub fn get(&self, id: JobId) -> Option<Arc<JobEntry>> {
        read(&self.jobs).get(&id).cloned()
    }

    /// Hand the job's control channel to its supervisor. Returns `None` if
    /// the job is unknown or already claimed, which guarantees at most one
    /// supervisor per job.
    pub fn claim(
        &self,
        id: JobId,
    ) -> Option<(Arc<JobEntry>, mpsc::UnboundedReceiver<StopSignal>)> {
        let entry = self.get(id)?;
        let control = lock(&entry.control_rx).take()?;
        Some((entry, control))
    }

    /// Apply a status transition plus any field updates, publish the result
    /// and record it. Releases the owner's quota on the first terminal
    /// transition.
    pub fn transition(
        &self,
        entry: &JobEntry,
        next: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<JobSnapshot, TransitionError> {
        let (snapshot, release) = {
            let mut job = lock(&entry.job);
            job.transition(next, Utc::now())?;
            apply(&mut job);
            if job.is_terminal() {
                job.pid = None;
            }
            job.seq += 1;
            let snapshot = job.snapshot();
            self.bus.publish(&Event::job_status(&snapshot));
            (snapshot, job.take_release())
        };

        if let Some(pps) = release {
            self.quota.release(snapshot.owner_id, pps);
        }
        self.recorder.snapshot(snapshot.clone());

        tracing::info!(
            job_id = %snapshot.id,
            status = %snapshot.status,
            packets_sent = snapshot.counters.packets_sent,
            error = snapshot.error_message.as_deref().unwrap_or(""),
            "Job status changed"
        );
        Ok(snapshot)
    }

    /// Raise the job's counters. With `publish`, also emit a status update.
    pub fn progress(&self, entry: &JobEntry, packets: u64, bytes: u64, publish: bool) {
        let mut job = lock(&entry.job);
        if job.is_terminal() {
            return;
        }
        job.counters.advance(packets, bytes);
        if publish {
            job.seq += 1;
            self.bus.publish(&Event::job_status(&job.snapshot()));
        }
    }

    pub fn push_output(&self, entry: &JobEntry, line: String) {
        lock(&entry.job).push_output(line, self.output_tail_lines);
    }

    /// Record the pid of a later invocation of a running job.
    pub fn set_pid(&self, entry: &JobEntry, pid: u32) {
        let mut job = lock(&entry.job);
        if job.status == JobStatus::Running {
            job.pid = Some(pid);
        }
    }

    /// Mark a stop request and hand it to the job's supervisor.
    ///
    /// Returns `Conflict` if the job has already finished. The caller does
    /// not wait for the process to exit.
    pub fn request_stop(&self, entry: &JobEntry, signal: StopSignal) -> Result<JobSnapshot, CoreError> {
        let mut job = lock(&entry.job);
        if job.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Job {} is already {}",
                job.id, job.status
            )));
        }
        if !job.cancel_requested {
            job.cancel_requested = true;
            job.cancel_reason = Some(signal.cause.describe());
        }
        job.seq += 1;
        let snapshot = job.snapshot();
        self.bus.publish(&Event::job_status(&snapshot));

        if entry.control.send(signal).is_err() {
            tracing::warn!(job_id = %job.id, "Stop requested for a job with no supervisor");
        }
        Ok(snapshot)
    }

    /// Newest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<JobSnapshot> {
        let entries: Vec<Arc<JobEntry>> = read(&self.jobs).values().cloned().collect();
        let mut jobs: Vec<JobSnapshot> = entries
            .iter()
            .filter_map(|entry| {
                let job = lock(&entry.job);
                filter.matches(&job).then(|| job.snapshot())
            })
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        jobs.into_iter().skip(filter.offset).take(limit).collect()
    }

    /// Ids of every job that has not reached a terminal state.
    pub fn active_ids(&self) -> Vec<JobId> {
        let entries: Vec<Arc<JobEntry>> = read(&self.jobs).values().cloned().collect();
        entries
            .iter()
            .filter_map(|entry| {
                let job = lock(&entry.job);
                (!job.is_terminal()).then_some(job.id)
            })
            .collect()
    }

    pub fn counts_by_status(&self) -> HashMap<JobStatus, usize> {
        let entries: Vec<Arc<JobEntry>> = read(&self.jobs).values().cloned().collect();
        let mut counts = HashMap::new();
        for entry in entries {
            *counts.entry(entry.status()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        read(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop terminal jobs that completed before `cutoff`. Returns the number
    /// removed.
    pub fn sweep(&self, cutoff: Timestamp) -> usize {
        let mut jobs = write(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let job = lock(&entry.job);
            !(job.is_terminal() && job.completed_at.is_some_and(|at| at < cutoff))
        });
        before - jobs.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use stormforge_core::quota::{GlobalLimits, QuotaLimits, QuotaRequest};
    use stormforge_core::roles::{Identity, Role};
    use stormforge_events::Scope;

    use super::*;
    use crate::engine::test_support::icmp_spec;

    struct Fixture {
        registry: JobRegistry,
        bus: Arc<EventBus>,
        quota: Arc<QuotaGuard>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(EventBus::default());
        let quota = Arc::new(QuotaGuard::new(QuotaLimits::default(), GlobalLimits::default()));
        let (recorder, _rx) = Recorder::new();
        Fixture {
            registry: JobRegistry::new(Arc::clone(&bus), recorder, Arc::clone(&quota), 3),
            bus,
            quota,
        }
    }

    fn admitted(f: &Fixture, owner: DbId) -> Arc<JobEntry> {
        f.quota
            .reserve(owner, QuotaRequest { pps: 10, duration_secs: 60 })
            .unwrap();
        let job = Job::new(owner, icmp_spec(), vec!["10.0.0.1".parse().unwrap()]);
        let snapshot = f.registry.insert(job);
        f.registry.get(snapshot.id).unwrap()
    }

    #[test]
    fn insert_publishes_admitted_with_first_seq() {
        let f = fixture();
        let mut sub = f.bus.subscribe(Scope::Global, Identity::new(1, Role::Admin));
        let entry = admitted(&f, 1);

        let event = sub.try_recv().unwrap();
        assert_eq!(event.job_id, Some(entry.id()));
        assert_eq!(event.seq, Some(1));
        assert_eq!(event.data["status"], "admitted");
    }

    #[test]
    fn terminal_transition_releases_quota_once() {
        let f = fixture();
        let entry = admitted(&f, 4);
        assert_eq!(f.quota.usage(4).running_jobs, 1);

        f.registry
            .transition(&entry, JobStatus::Running, |job| job.pid = Some(99))
            .unwrap();
        let done = f
            .registry
            .transition(&entry, JobStatus::Completed, |_| {})
            .unwrap();
        assert_eq!(done.pid, None);
        assert_eq!(f.quota.usage(4).running_jobs, 0);
        assert_eq!(f.quota.usage(4).reserved_pps, 0);

        let again = f.registry.transition(&entry, JobStatus::Failed, |_| {});
        assert_matches!(again, Err(TransitionError { from: JobStatus::Completed, .. }));
        assert_eq!(f.quota.usage(4).running_jobs, 0);
    }

    #[test]
    fn stop_request_reaches_the_claimed_channel() {
        let f = fixture();
        let entry = admitted(&f, 1);
        let (_claimed, mut control) = f.registry.claim(entry.id()).unwrap();
        assert!(f.registry.claim(entry.id()).is_none());

        let signal = StopSignal {
            force: true,
            cause: StopCause::Emergency,
        };
        let snapshot = f.registry.request_stop(&entry, signal.clone()).unwrap();
        assert!(snapshot.cancel_requested);
        assert_eq!(snapshot.cancel_reason.as_deref(), Some("emergency stop"));
        assert_eq!(control.try_recv().unwrap(), signal);
    }

    #[test]
    fn stop_on_terminal_job_conflicts() {
        let f = fixture();
        let entry = admitted(&f, 1);
        f.registry
            .transition(&entry, JobStatus::Cancelled, |_| {})
            .unwrap();
        let result = f.registry.request_stop(
            &entry,
            StopSignal {
                force: false,
                cause: StopCause::Shutdown,
            },
        );
        assert_matches!(result, Err(CoreError::Conflict(_)));
    }

    #[test]
    fn output_tail_is_bounded() {
        let f = fixture();
        let entry = admitted(&f, 1);
        for i in 0..5 {
            f.registry.push_output(&entry, format!("line {i}"));
        }
        let snapshot = entry.detailed_snapshot();
        assert_eq!(snapshot.output_tail, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(snapshot.counters.output_lines, 5);
    }

    #[test]
    fn list_filters_and_sweep_keeps_active_jobs() {
        let f = fixture();
        let a = admitted(&f, 1);
        let _b = admitted(&f, 2);
        f.registry.transition(&a, JobStatus::Cancelled, |_| {}).unwrap();

        let mine = f.registry.list(&JobFilter {
            owner_id: Some(1),
            ..JobFilter::default()
        });
        assert_eq!(mine.len(), 1);

        let active = f.registry.list(&JobFilter {
            statuses: Some([JobStatus::Admitted].into_iter().collect()),
            ..JobFilter::default()
        });
        assert_eq!(active.len(), 1);
        assert_eq!(f.registry.active_ids().len(), 1);

        let removed = f.registry.sweep(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 1);
        assert_eq!(f.registry.len(), 1);
    }
}
