//! Event type names, system event names and audit action names.
//!
//! Shared by the engine (which publishes and records them) and the
//! WebSocket layer (which filters on them).

/// Snapshot of a job after a status change or a progress tick.
pub const MSG_TYPE_JOB_STATUS_UPDATE: &str = "job_status_update";

/// Process-wide notice (emergency stop, policy reload).
pub const MSG_TYPE_SYSTEM_EVENT: &str = "system_event";

/// Administrative action visible to admins only.
pub const MSG_TYPE_ADMIN_ACTION: &str = "admin_action";

/// First message on every new WebSocket connection.
pub const MSG_TYPE_CONNECTION_ESTABLISHED: &str = "connection_established";

/// Reply to a client `ping` message.
pub const MSG_TYPE_PONG: &str = "pong";

/// Reply to a client `request_stats` message.
pub const MSG_TYPE_SYSTEM_STATS: &str = "system_stats";

// ---------------------------------------------------------------------------
// System event names (carried in `data.event`)
// ---------------------------------------------------------------------------

pub const SYSTEM_EMERGENCY_STOP_ENGAGED: &str = "emergency_stop_engaged";
pub const SYSTEM_EMERGENCY_STOP_RELEASED: &str = "emergency_stop_released";
pub const SYSTEM_TARGET_POLICY_RELOADED: &str = "target_policy_reloaded";

// ---------------------------------------------------------------------------
// Audit actions
// ---------------------------------------------------------------------------

pub const AUDIT_JOB_SUBMIT: &str = "job.submit";
pub const AUDIT_JOB_STOP: &str = "job.stop";
pub const AUDIT_JOB_FORCE_STOP: &str = "job.force_stop";
pub const AUDIT_EMERGENCY_STOP_ENGAGE: &str = "emergency_stop.engage";
pub const AUDIT_EMERGENCY_STOP_RELEASE: &str = "emergency_stop.release";
pub const AUDIT_TARGET_LIST_ADD: &str = "target_list.add";
pub const AUDIT_TARGET_LIST_REMOVE: &str = "target_list.remove";
pub const AUDIT_QUOTA_UPDATE: &str = "quota.update";
