//! StormForge event distribution and persistence recording.
//!
//! - [`EventBus`] fans job and system events out to scoped subscribers
//!   over bounded per-subscriber queues.
//! - [`Recorder`] / [`JobRecorder`] serialise snapshot and audit writes
//!   through one background task so they reach storage in order.

pub mod bus;
pub mod persistence;

pub use bus::{Event, EventBus, EventKind, Scope, Subscription};
pub use persistence::{JobRecorder, Record, Recorder};
