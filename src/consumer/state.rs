//! Worker lifecycle.
//!
//! ```text
//! STOPPED --run--> STARTED --request_shutdown--> SHUTTING_DOWN --loop exit--> STOPPED
//!                     |
//!                     +--reconnect budget exhausted--> FAULTY
//! ```
//!
//! The state is the only part of an engine shared between threads. All
//! transitions go through compare-and-swap on an [`AtomicU8`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Started = 1,
    ShuttingDown = 2,
    Faulty = 3,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WorkerState::Started,
            2 => WorkerState::ShuttingDown,
            3 => WorkerState::Faulty,
            _ => WorkerState::Stopped,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Stopped, Started)
                | (Stopped, ShuttingDown)
                | (Started, ShuttingDown)
                | (Started, Faulty)
                | (Started, Stopped)
                | (ShuttingDown, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Stopped => "STOPPED",
            WorkerState::Started => "STARTED",
            WorkerState::ShuttingDown => "SHUTTING_DOWN",
            WorkerState::Faulty => "FAULTY",
        };
        f.write_str(name)
    }
}

/// Atomic holder of a [`WorkerState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self(AtomicU8::new(WorkerState::Stopped as u8))
    }
}

impl StateCell {
    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_started(&self) -> bool {
        self.load() == WorkerState::Started
    }

    fn transition(&self, from: WorkerState, to: WorkerState) -> bool {
        debug_assert!(from.can_transition(to));
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// STOPPED -> STARTED. Returns the current state on failure.
    pub fn start(&self) -> Result<(), WorkerState> {
        if self.transition(WorkerState::Stopped, WorkerState::Started) {
            Ok(())
        } else {
            Err(self.load())
        }
    }

    /// Moves a stopped or running worker to SHUTTING_DOWN. Idempotent.
    ///
    /// Returns `false` when the request had no effect (already shutting down
    /// or faulty).
    pub fn request_shutdown(&self) -> bool {
        self.transition(WorkerState::Started, WorkerState::ShuttingDown)
            || self.transition(WorkerState::Stopped, WorkerState::ShuttingDown)
    }

    /// STARTED -> FAULTY. Has no effect when shutdown was requested meanwhile.
    pub fn mark_faulty(&self) -> bool {
        self.transition(WorkerState::Started, WorkerState::Faulty)
    }

    /// Final transition of a run: back to STOPPED unless FAULTY.
    pub fn finish(&self) -> WorkerState {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                match WorkerState::from_u8(raw) {
                    WorkerState::Faulty | WorkerState::Stopped => None,
                    WorkerState::Started | WorkerState::ShuttingDown => {
                        Some(WorkerState::Stopped as u8)
                    }
                }
            });
        self.load()
    }
}
