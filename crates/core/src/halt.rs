//! Process-wide emergency stop switch.
//!
//! A single compare-and-set flag plus a record of who engaged it. The
//! switch itself only refuses admissions; signalling running jobs is the
//! orchestrator's job once [`EmergencyStop::engage`] reports a change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::sync::lock;
use crate::types::{DbId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HaltState {
    pub engaged: bool,
    pub engaged_at: Option<Timestamp>,
    pub engaged_by: Option<DbId>,
}

#[derive(Debug, Default)]
pub struct EmergencyStop {
    engaged: AtomicBool,
    details: Mutex<Option<(Timestamp, DbId)>>,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Engage the switch. Returns `true` only for the caller that flipped it.
    pub fn engage(&self, actor: DbId) -> bool {
        let changed = self
            .engaged
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            *lock(&self.details) = Some((chrono::Utc::now(), actor));
        }
        changed
    }

    /// Release the switch. Returns `true` only for the caller that flipped it.
    pub fn release(&self) -> bool {
        let changed = self
            .engaged
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if changed {
            *lock(&self.details) = None;
        }
        changed
    }

    pub fn state(&self) -> HaltState {
        let details = *lock(&self.details);
        HaltState {
            engaged: self.is_engaged(),
            engaged_at: details.map(|(at, _)| at),
            engaged_by: details.map(|(_, by)| by),
        }
    }
}
