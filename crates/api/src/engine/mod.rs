//! Job orchestration engine.
//!
//! - [`registry`] holds the canonical job records and publishes every
//!   change.
//! - [`supervisor`] runs one task per job that owns the external process.
//! - [`policy`] caches the admin target lists.
//! - [`orchestrator`] is the facade the transport layer talks to.

pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod supervisor;

pub use orchestrator::Orchestrator;
