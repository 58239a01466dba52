// src/lifecycle/mod.rs
//! Engine lifecycle
//!
//! - **Service**: owns every component and starts them in dependency order
//! - **Shutdown**: graceful and forced stop sequences
//! - **Restart**: stop, reload configuration, reinitialize with retries
//!
//! Both orchestrators share one [`Lifecycle`] phase machine so that at most
//! one sequence runs at a time:
//!
//! ```text
//! Idle ──► Restarting ──► Idle | Degraded
//! Idle | Degraded ──► ShuttingDown ──► Stopped
//! ```

pub mod restart;
pub mod service;
pub mod shutdown;

pub use restart::{RestartManager, RestartOutcome, RestartSnapshot};
pub use service::Service;
pub use shutdown::{ShutdownManager, ShutdownReport, StepReport};

use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    Restarting,
    ShuttingDown,
    /// A restart gave up; components may be partially stopped
    Degraded,
    Stopped,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "idle",
            LifecyclePhase::Restarting => "restarting",
            LifecyclePhase::ShuttingDown => "shutting_down",
            LifecyclePhase::Degraded => "degraded",
            LifecyclePhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Restart,
    Shutdown,
}

impl Sequence {
    fn active_phase(self) -> LifecyclePhase {
        match self {
            Sequence::Restart => LifecyclePhase::Restarting,
            Sequence::Shutdown => LifecyclePhase::ShuttingDown,
        }
    }
}

/// Process-wide lifecycle phase
pub struct Lifecycle {
    phase: Mutex<LifecyclePhase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(LifecyclePhase::Idle),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock()
    }

    /// Enter `sequence`, failing fast if another one is running.
    ///
    /// The returned guard records the outcome; dropping it without calling
    /// [`PhaseGuard::finish`] leaves the engine `Degraded`.
    pub fn begin(&self, sequence: Sequence) -> Result<PhaseGuard<'_>> {
        let mut phase = self.phase.lock();
        match *phase {
            LifecyclePhase::Idle | LifecyclePhase::Degraded => {}
            LifecyclePhase::Restarting => return Err(EngineError::LifecycleConflict("restart")),
            LifecyclePhase::ShuttingDown => {
                return Err(EngineError::LifecycleConflict("shutdown"))
            }
            LifecyclePhase::Stopped => {
                return Err(EngineError::InvalidLifecycleState(
                    "engine is stopped".to_string(),
                ))
            }
        }

        let from = *phase;
        *phase = sequence.active_phase();
        debug!(from = %from, to = %*phase, "Lifecycle phase changed");

        Ok(PhaseGuard {
            lifecycle: self,
            sequence,
            done: false,
        })
    }

    fn set(&self, next: LifecyclePhase) {
        let mut phase = self.phase.lock();
        debug!(from = %*phase, to = %next, "Lifecycle phase changed");
        *phase = next;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the phase for one running sequence
pub struct PhaseGuard<'a> {
    lifecycle: &'a Lifecycle,
    sequence: Sequence,
    done: bool,
}

impl PhaseGuard<'_> {
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn finish(mut self, outcome: LifecyclePhase) {
        self.done = true;
        self.lifecycle.set(outcome);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.lifecycle.set(LifecyclePhase::Degraded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_sequence_at_a_time() {
        let lifecycle = Lifecycle::new();
        let guard = lifecycle.begin(Sequence::Restart).unwrap();
        assert_eq!(lifecycle.phase(), LifecyclePhase::Restarting);

        let err = lifecycle.begin(Sequence::Restart).err().unwrap();
        assert_eq!(err.to_string(), "restart already in progress");
        assert!(matches!(
            lifecycle.begin(Sequence::Shutdown),
            Err(EngineError::LifecycleConflict("restart"))
        ));

        guard.finish(LifecyclePhase::Idle);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Idle);
    }

    #[test]
    fn test_degraded_allows_retry_and_shutdown() {
        let lifecycle = Lifecycle::new();
        lifecycle
            .begin(Sequence::Restart)
            .unwrap()
            .finish(LifecyclePhase::Degraded);

        let retry = lifecycle.begin(Sequence::Restart).unwrap();
        retry.finish(LifecyclePhase::Degraded);

        let shutdown = lifecycle.begin(Sequence::Shutdown).unwrap();
        assert!(matches!(
            lifecycle.begin(Sequence::Restart),
            Err(EngineError::LifecycleConflict("shutdown"))
        ));
        shutdown.finish(LifecyclePhase::Stopped);

        assert!(matches!(
            lifecycle.begin(Sequence::Shutdown),
            Err(EngineError::InvalidLifecycleState(_))
        ));
    }

    #[test]
    fn test_dropped_guard_degrades() {
        let lifecycle = Lifecycle::new();
        {
            let _guard = lifecycle.begin(Sequence::Restart).unwrap();
        }
        assert_eq!(lifecycle.phase(), LifecyclePhase::Degraded);
    }
}
