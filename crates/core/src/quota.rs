//! Per-user and global admission quotas.
//!
//! Each user has a running-job count, a reserved packet rate and a trailing
//! window of accepted submission times, all behind one per-user mutex. A
//! reservation and the caller's commit step (the registry insert) run under
//! that mutex together, so a reservation never exists without its job.
//!
//! Lock order: user map, then user entry, then global counters.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::sync::{lock, read, write};
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Ceilings applied to a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_concurrent_jobs: u32,
    /// Aggregate requested pps across the user's non-terminal jobs.
    pub pps_budget: u64,
    /// Accepted submissions allowed per `rate_window_secs`.
    pub max_submissions: u32,
    pub rate_window_secs: u64,
    pub max_job_duration_secs: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            pps_budget: 1_000,
            max_submissions: 20,
            rate_window_secs: 60,
            max_job_duration_secs: 3_600,
        }
    }
}

/// Process-wide ceilings across all users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub max_concurrent_jobs: u32,
    pub pps_budget: u64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 50,
            pps_budget: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Rejections and requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaRejection {
    #[error("max_concurrent_jobs_exceeded: {running} of {limit} jobs already active")]
    MaxConcurrentJobsExceeded { running: u32, limit: u32 },

    #[error("rate_window_exceeded: at most {limit} submissions per {window_secs}s")]
    RateWindowExceeded { limit: u32, window_secs: u64 },

    #[error("pps_budget_exceeded: requested {requested} pps with {reserved} of {limit} reserved")]
    PpsBudgetExceeded {
        requested: u64,
        reserved: u64,
        limit: u64,
    },

    #[error("duration_limit_exceeded: {requested}s exceeds the {limit}s limit")]
    DurationLimitExceeded { requested: u64, limit: u64 },

    #[error("global_capacity_exceeded: {resource} is at capacity")]
    GlobalCapacityExceeded { resource: &'static str },
}

impl QuotaRejection {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaRejection::MaxConcurrentJobsExceeded { .. } => "max_concurrent_jobs_exceeded",
            QuotaRejection::RateWindowExceeded { .. } => "rate_window_exceeded",
            QuotaRejection::PpsBudgetExceeded { .. } => "pps_budget_exceeded",
            QuotaRejection::DurationLimitExceeded { .. } => "duration_limit_exceeded",
            QuotaRejection::GlobalCapacityExceeded { .. } => "global_capacity_exceeded",
        }
    }
}

/// What a job asks of its owner's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaRequest {
    pub pps: u64,
    /// Expected wall-clock run time.
    pub duration_secs: u64,
}

/// Proof of an accepted reservation, handed to the commit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: DbId,
    pub pps: u64,
}

/// Failure of [`QuotaGuard::reserve_with`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReserveError<E> {
    Rejected(QuotaRejection),
    Commit(E),
}

/// Live usage for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub running_jobs: u32,
    pub reserved_pps: u64,
    pub submissions_in_window: u32,
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UserQuota {
    overrides: Option<QuotaLimits>,
    running_jobs: u32,
    reserved_pps: u64,
    submissions: VecDeque<Instant>,
}

impl UserQuota {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.submissions.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.submissions.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Default)]
struct GlobalUsage {
    running_jobs: u32,
    reserved_pps: u64,
}

#[derive(Debug)]
pub struct QuotaGuard {
    defaults: QuotaLimits,
    global_limits: GlobalLimits,
    users: RwLock<HashMap<DbId, Arc<Mutex<UserQuota>>>>,
    global: Mutex<GlobalUsage>,
}

impl QuotaGuard {
    pub fn new(defaults: QuotaLimits, global_limits: GlobalLimits) -> Self {
        Self {
            defaults,
            global_limits,
            users: RwLock::new(HashMap::new()),
            global: Mutex::new(GlobalUsage::default()),
        }
    }

    pub fn defaults(&self) -> QuotaLimits {
        self.defaults
    }

    pub fn global_limits(&self) -> GlobalLimits {
        self.global_limits
    }

    fn entry(&self, user_id: DbId) -> Arc<Mutex<UserQuota>> {
        if let Some(entry) = read(&self.users).get(&user_id) {
            return Arc::clone(entry);
        }
        Arc::clone(write(&self.users).entry(user_id).or_default())
    }

    /// Effective limits for a user (override or defaults).
    pub fn limits_for(&self, user_id: DbId) -> QuotaLimits {
        lock(&self.entry(user_id)).overrides.unwrap_or(self.defaults)
    }

    /// Install a per-user override. Running jobs keep their reservations.
    pub fn set_limits(&self, user_id: DbId, limits: QuotaLimits) {
        lock(&self.entry(user_id)).overrides = Some(limits);
    }

    pub fn usage(&self, user_id: DbId) -> QuotaUsage {
        let entry = self.entry(user_id);
        let mut quota = lock(&entry);
        let window = Duration::from_secs(quota.overrides.unwrap_or(self.defaults).rate_window_secs);
        quota.prune(Instant::now(), window);
        QuotaUsage {
            running_jobs: quota.running_jobs,
            reserved_pps: quota.reserved_pps,
            submissions_in_window: quota.submissions.len() as u32,
        }
    }

    /// `(running_jobs, reserved_pps)` across all users.
    pub fn global_usage(&self) -> (u32, u64) {
        let global = lock(&self.global);
        (global.running_jobs, global.reserved_pps)
    }

    /// Reserve without a commit step.
    pub fn reserve(&self, user_id: DbId, request: QuotaRequest) -> Result<Reservation, QuotaRejection> {
        match self.reserve_with(user_id, request, Ok::<_, std::convert::Infallible>) {
            Ok(reservation) => Ok(reservation),
            Err(ReserveError::Rejected(rejection)) => Err(rejection),
            Err(ReserveError::Commit(never)) => match never {},
        }
    }

    /// Check every ceiling and, if all pass, run `commit` while the user's
    /// quota is still locked. Counters are only applied when `commit`
    /// succeeds, and the submission is only counted against the rate window
    /// then.
    pub fn reserve_with<T, E>(
        &self,
        user_id: DbId,
        request: QuotaRequest,
        commit: impl FnOnce(Reservation) -> Result<T, E>,
    ) -> Result<T, ReserveError<E>> {
        self.reserve_with_at(user_id, request, Instant::now(), commit)
    }

    fn reserve_with_at<T, E>(
        &self,
        user_id: DbId,
        request: QuotaRequest,
        now: Instant,
        commit: impl FnOnce(Reservation) -> Result<T, E>,
    ) -> Result<T, ReserveError<E>> {
        let entry = self.entry(user_id);
        let mut quota = lock(&entry);
        let limits = quota.overrides.unwrap_or(self.defaults);

        if request.duration_secs > limits.max_job_duration_secs {
            return Err(ReserveError::Rejected(QuotaRejection::DurationLimitExceeded {
                requested: request.duration_secs,
                limit: limits.max_job_duration_secs,
            }));
        }

        if quota.running_jobs >= limits.max_concurrent_jobs {
            return Err(ReserveError::Rejected(
                QuotaRejection::MaxConcurrentJobsExceeded {
                    running: quota.running_jobs,
                    limit: limits.max_concurrent_jobs,
                },
            ));
        }

        quota.prune(now, Duration::from_secs(limits.rate_window_secs));
        if quota.submissions.len() >= limits.max_submissions as usize {
            return Err(ReserveError::Rejected(QuotaRejection::RateWindowExceeded {
                limit: limits.max_submissions,
                window_secs: limits.rate_window_secs,
            }));
        }

        if quota.reserved_pps.saturating_add(request.pps) > limits.pps_budget {
            return Err(ReserveError::Rejected(QuotaRejection::PpsBudgetExceeded {
                requested: request.pps,
                reserved: quota.reserved_pps,
                limit: limits.pps_budget,
            }));
        }

        let mut global = lock(&self.global);
        if global.running_jobs >= self.global_limits.max_concurrent_jobs {
            return Err(ReserveError::Rejected(
                QuotaRejection::GlobalCapacityExceeded {
                    resource: "concurrent jobs",
                },
            ));
        }
        if global.reserved_pps.saturating_add(request.pps) > self.global_limits.pps_budget {
            return Err(ReserveError::Rejected(
                QuotaRejection::GlobalCapacityExceeded {
                    resource: "packet rate",
                },
            ));
        }

        let reservation = Reservation {
            user_id,
            pps: request.pps,
        };
        let committed = commit(reservation).map_err(ReserveError::Commit)?;

        quota.running_jobs += 1;
        quota.reserved_pps += request.pps;
        quota.submissions.push_back(now);
        global.running_jobs += 1;
        global.reserved_pps += request.pps;

        Ok(committed)
    }

    /// Return a reservation. Saturates at zero so an unmatched release can
    /// never drive a counter negative.
    pub fn release(&self, user_id: DbId, pps: u64) {
        let entry = self.entry(user_id);
        let mut quota = lock(&entry);
        quota.running_jobs = quota.running_jobs.saturating_sub(1);
        quota.reserved_pps = quota.reserved_pps.saturating_sub(pps);

        let mut global = lock(&self.global);
        global.running_jobs = global.running_jobs.saturating_sub(1);
        global.reserved_pps = global.reserved_pps.saturating_sub(pps);
    }
}

impl Default for QuotaGuard {
    fn default() -> Self {
        Self::new(QuotaLimits::default(), GlobalLimits::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
