//! Admission: the single gate between a submission and the registry.
//!
//! Order of checks: emergency stop, static parameter validation, target
//! policy for each distinct target, host expansion, then the quota
//! reservation. The reservation and the caller's commit step (inserting the
//! job into the registry) happen together under the owner's quota lock.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::error::CoreError;
use crate::halt::EmergencyStop;
use crate::job::{Job, JobSpec};
use crate::quota::{QuotaGuard, QuotaRejection, QuotaRequest, ReserveError};
use crate::roles::Identity;
use crate::targets::{expand_hosts, parse_target, TargetPolicy, TargetVerdict};
use crate::validation::validate_job_spec;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A policy decision against the submission, reported verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyRejection {
    #[error("target {target} rejected: {reason}")]
    TargetRejected { target: String, reason: String },

    #[error("{0}")]
    Quota(QuotaRejection),

    #[error("system_halted: emergency stop is engaged")]
    SystemHalted,
}

impl PolicyRejection {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyRejection::TargetRejected { .. } => "target_rejected",
            PolicyRejection::Quota(q) => q.code(),
            PolicyRejection::SystemHalted => "system_halted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Policy(#[from] PolicyRejection),
}

impl From<CoreError> for AdmissionError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => AdmissionError::Validation(msg),
            other => AdmissionError::Validation(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct AdmissionPipeline {
    quota: Arc<QuotaGuard>,
    halt: Arc<EmergencyStop>,
    max_hosts_per_job: usize,
}

impl AdmissionPipeline {
    pub fn new(quota: Arc<QuotaGuard>, halt: Arc<EmergencyStop>, max_hosts_per_job: usize) -> Self {
        Self {
            quota,
            halt,
            max_hosts_per_job,
        }
    }

    /// Run every check and, on success, hand the pending job to `commit`
    /// while the owner's quota is held.
    ///
    /// `commit` runs at most once and never for a rejected submission.
    pub fn admit<T>(
        &self,
        owner: &Identity,
        spec: JobSpec,
        policy: &TargetPolicy,
        commit: impl FnOnce(Job) -> T,
    ) -> Result<T, AdmissionError> {
        if self.halt.is_engaged() {
            return Err(PolicyRejection::SystemHalted.into());
        }

        let spec = normalise(spec);
        validate_job_spec(&spec)?;

        let mut networks = Vec::with_capacity(spec.targets.len());
        let mut seen = HashSet::new();
        for target in &spec.targets {
            let net = parse_target(target).map_err(AdmissionError::Validation)?;
            if !seen.insert(net) {
                continue;
            }
            if let TargetVerdict::Rejected(reason) = policy.validate_network(&net) {
                return Err(PolicyRejection::TargetRejected {
                    target: target.clone(),
                    reason,
                }
                .into());
            }
            networks.push(net);
        }

        let hosts = expand_hosts(&networks, self.max_hosts_per_job)
            .map_err(|e| AdmissionError::Validation(format!("targets: {e}")))?;

        let pps = u64::from(spec.pps);
        let duration_secs = spec
            .duration_secs
            .or_else(|| spec.max_packets.map(|m| m.div_ceil(pps)))
            .unwrap_or(0);
        let request = QuotaRequest { pps, duration_secs };

        let mut job = Job::new(owner.user_id, spec, hosts);
        let result = self.quota.reserve_with(owner.user_id, request, |reservation| {
            job.reserved_pps = reservation.pps;
            Ok::<_, std::convert::Infallible>(commit(job))
        });

        match result {
            Ok(committed) => Ok(committed),
            Err(ReserveError::Rejected(rejection)) => {
                Err(PolicyRejection::Quota(rejection).into())
            }
            Err(ReserveError::Commit(never)) => match never {},
        }
    }
}

/// Trim targets and drop duplicate tags, keeping first occurrences.
fn normalise(mut spec: JobSpec) -> JobSpec {
    spec.name = spec.name.trim().to_string();
    for target in &mut spec.targets {
        *target = target.trim().to_string();
    }
    let mut seen = HashSet::new();
    spec.tags.retain(|tag| seen.insert(tag.clone()));
    spec
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
