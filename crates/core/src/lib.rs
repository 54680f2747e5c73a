//! StormForge domain core.
//!
//! Pure building blocks for the job orchestration engine: the job model and
//! its state machine, parameter validation, target policy, command
//! rendering, quota accounting, the emergency-stop switch, tool output
//! parsing and process-group primitives. Nothing in this crate talks to a
//! database or an HTTP client.

pub mod admission;
pub mod command;
pub mod error;
pub mod halt;
pub mod hping;
pub mod job;
pub mod job_events;
pub mod process;
pub mod quota;
pub mod roles;
pub mod sync;
pub mod targets;
pub mod types;
pub mod validation;
