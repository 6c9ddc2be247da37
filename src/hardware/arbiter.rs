//! Exclusive access to the shared stage and measurement hardware.
//!
//! The sweep path, the streaming pipeline and the calibration routine drive
//! the same physical devices. Each must hold the arbiter's guard for as long
//! as it touches them. Acquisition never waits: contention is reported as
//! [`DaqError::ResourceBusy`] before anything is moved or acquired.

use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which path currently drives the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareOwner {
    /// A parameter sweep
    Sweep,
    /// The continuous streaming pipeline
    Streaming,
    /// The shaker calibration routine
    Calibration,
    /// A single stage move requested by the operator
    ManualMove,
}

impl fmt::Display for HardwareOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareOwner::Sweep => write!(f, "sweep"),
            HardwareOwner::Streaming => write!(f, "streaming"),
            HardwareOwner::Calibration => write!(f, "calibration"),
            HardwareOwner::ManualMove => write!(f, "manual stage move"),
        }
    }
}

/// Shared try-lock naming its holder. Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct HardwareArbiter {
    owner: Arc<Mutex<Option<HardwareOwner>>>,
}

impl HardwareArbiter {
    /// Unowned arbiter
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the hardware for `who`, or fail naming the current holder.
    pub fn try_acquire(&self, who: HardwareOwner) -> AppResult<HardwareGuard> {
        let mut owner = self.owner.lock();
        if let Some(current) = *owner {
            return Err(DaqError::ResourceBusy(format!(
                "{who} requested while {current} holds the hardware"
            )));
        }
        *owner = Some(who);
        debug!(owner = %who, "hardware acquired");
        Ok(HardwareGuard {
            arbiter: self.clone(),
            owner: who,
        })
    }

    /// Current holder, if any
    pub fn owner(&self) -> Option<HardwareOwner> {
        *self.owner.lock()
    }
}

/// Releases the hardware when dropped.
#[derive(Debug)]
pub struct HardwareGuard {
    arbiter: HardwareArbiter,
    owner: HardwareOwner,
}

impl HardwareGuard {
    /// Path holding this guard
    pub fn owner(&self) -> HardwareOwner {
        self.owner
    }
}

impl Drop for HardwareGuard {
    fn drop(&mut self) {
        *self.arbiter.owner.lock() = None;
        debug!(owner = %self.owner, "hardware released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_owner_is_rejected_until_release() {
        let arbiter = HardwareArbiter::new();
        let guard = arbiter.try_acquire(HardwareOwner::Streaming).unwrap();
        assert_eq!(arbiter.owner(), Some(HardwareOwner::Streaming));

        let err = arbiter.try_acquire(HardwareOwner::Calibration).unwrap_err();
        assert!(matches!(err, DaqError::ResourceBusy(msg) if msg.contains("streaming")));

        drop(guard);
        assert_eq!(arbiter.owner(), None);
        let guard = arbiter.try_acquire(HardwareOwner::Sweep).unwrap();
        assert_eq!(guard.owner(), HardwareOwner::Sweep);
    }
}
