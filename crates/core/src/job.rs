//! Job model: declarative parameters, runtime record and state machine.
//!
//! ```text
//! pending ──► admitted ──► running ──► completed
//!    │            │           ├──────► failed
//!    │            │           └──────► cancelled
//!    │            ├──► completed   (dry run only)
//!    ├────────────┴──► failed
//!    └────────────────► cancelled
//! ```

use std::collections::VecDeque;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::types::{DbId, JobId, Timestamp};
use crate::validation::{validate_tags, validate_target_syntax};

// ---------------------------------------------------------------------------
// Traffic type and priority
// ---------------------------------------------------------------------------

/// Closed set of traffic patterns the wrapped tool can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrafficType {
    Icmp,
    TcpSyn,
    TcpAck,
    TcpRst,
    Udp,
}

impl TrafficType {
    pub fn as_str(self) -> &'static str {
        match self {
            TrafficType::Icmp => "icmp",
            TrafficType::TcpSyn => "tcp-syn",
            TrafficType::TcpAck => "tcp-ack",
            TrafficType::TcpRst => "tcp-rst",
            TrafficType::Udp => "udp",
        }
    }

    /// Port-addressed types require a destination port and accept a source
    /// port. ICMP accepts neither.
    pub fn uses_ports(self) -> bool {
        !matches!(self, TrafficType::Icmp)
    }

    /// IPv4 + transport header bytes per packet, used until the tool reports
    /// its own figure.
    pub fn header_bytes(self) -> u64 {
        match self {
            TrafficType::Icmp | TrafficType::Udp => 28,
            TrafficType::TcpSyn | TrafficType::TcpAck | TrafficType::TcpRst => 40,
        }
    }
}

impl std::fmt::Display for TrafficType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling hint. Stored and reported, not used for ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Status and transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Admitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Admitted,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Admitted => "admitted",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The raw transition table. `admitted -> completed` is further
    /// restricted to dry runs by [`Job::transition`].
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Admitted | Failed | Cancelled)
                | (Admitted, Running | Completed | Failed | Cancelled)
                | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

// ---------------------------------------------------------------------------
// Job parameters
// ---------------------------------------------------------------------------

fn default_ttl() -> u8 {
    64
}

/// Declarative parameters of a job as submitted.
///
/// Field-level limits are declared here; cross-field rules (ports per
/// traffic type, termination condition, interface name) live in
/// [`crate::validation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct JobSpec {
    #[validate(length(min = 1, max = 100, message = "must be 1-100 characters"))]
    pub name: String,

    #[validate(
        length(min = 1, max = 100, message = "must list 1-100 targets"),
        custom(function = "validate_target_syntax")
    )]
    pub targets: Vec<String>,

    pub traffic_type: TrafficType,

    #[serde(default)]
    pub dst_port: Option<u16>,

    #[serde(default)]
    pub src_port: Option<u16>,

    #[validate(range(min = 1, max = 10000, message = "must be between 1 and 10000"))]
    pub pps: u32,

    #[serde(default)]
    #[validate(range(min = 1, max = 86400, message = "must be between 1 and 86400 seconds"))]
    pub duration_secs: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1, max = 1000000, message = "must be between 1 and 1000000"))]
    pub max_packets: Option<u64>,

    #[serde(default)]
    #[validate(range(max = 65507, message = "must not exceed 65507 bytes"))]
    pub packet_size: u32,

    #[serde(default = "default_ttl")]
    #[validate(range(min = 1, message = "must be between 1 and 255"))]
    pub ttl: u8,

    #[serde(default)]
    pub iface: Option<String>,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    #[validate(
        length(max = 10, message = "at most 10 tags"),
        custom(function = "validate_tags")
    )]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Runtime record
// ---------------------------------------------------------------------------

/// Progress counters. Only ever move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub output_lines: u64,
}

impl JobCounters {
    /// Raise packet and byte counters to the observed totals, never lowering
    /// either.
    pub fn advance(&mut self, packets: u64, bytes: u64) {
        self.packets_sent = self.packets_sent.max(packets);
        self.bytes_sent = self.bytes_sent.max(bytes);
    }
}

/// The canonical job record held by the registry.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub owner_id: DbId,
    pub spec: JobSpec,
    /// Expanded host list the supervisor walks, in order.
    pub hosts: Vec<IpAddr>,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub counters: JobCounters,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    /// Packet rate held against the owner's quota while non-terminal.
    pub reserved_pps: u64,
    pub quota_released: bool,
    pub output_tail: VecDeque<String>,
    /// Sequence number of the last published status event.
    pub seq: u64,
}

impl Job {
    pub fn new(owner_id: DbId, spec: JobSpec, hosts: Vec<IpAddr>) -> Self {
        let reserved_pps = u64::from(spec.pps);
        Self {
            id: uuid::Uuid::now_v7(),
            owner_id,
            spec,
            hosts,
            status: JobStatus::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            counters: JobCounters::default(),
            pid: None,
            error_message: None,
            cancel_requested: false,
            cancel_reason: None,
            reserved_pps,
            quota_released: false,
            output_tail: VecDeque::new(),
            seq: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition, stamping the matching timestamp.
    pub fn transition(&mut self, next: JobStatus, now: Timestamp) -> Result<(), TransitionError> {
        let allowed = self.status.can_transition_to(next)
            && !(self.status == JobStatus::Admitted
                && next == JobStatus::Completed
                && !self.spec.dry_run);
        if !allowed {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.completed_at = Some(now);
                self.pid = None;
            }
            _ => {}
        }
        Ok(())
    }

    /// Hand out the quota reservation exactly once, after the job has
    /// reached a terminal state. Later calls return `None`.
    pub fn take_release(&mut self) -> Option<u64> {
        if !self.is_terminal() || self.quota_released {
            return None;
        }
        self.quota_released = true;
        Some(self.reserved_pps)
    }

    /// Append one output line, keeping only the newest `limit` lines.
    pub fn push_output(&mut self, line: String, limit: usize) {
        self.counters.output_lines += 1;
        if limit == 0 {
            return;
        }
        while self.output_tail.len() >= limit {
            self.output_tail.pop_front();
        }
        self.output_tail.push_back(line);
    }

    /// Compact snapshot used in events and lists.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            owner_id: self.owner_id,
            spec: self.spec.clone(),
            hosts: self.hosts.iter().map(ToString::to_string).collect(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            counters: self.counters,
            pid: self.pid,
            error_message: self.error_message.clone(),
            cancel_requested: self.cancel_requested,
            cancel_reason: self.cancel_reason.clone(),
            seq: self.seq,
            output_tail: Vec::new(),
        }
    }

    /// Snapshot including the retained output tail.
    pub fn detailed_snapshot(&self) -> JobSnapshot {
        let mut snapshot = self.snapshot();
        snapshot.output_tail = self.output_tail.iter().cloned().collect();
        snapshot
    }
}

/// Read-only copy of a job handed to callers, subscribers and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub owner_id: DbId,
    #[serde(flatten)]
    pub spec: JobSpec,
    pub hosts: Vec<String>,
    pub status: JobStatus,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub pid: Option<u32>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub cancel_reason: Option<String>,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_tail: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
