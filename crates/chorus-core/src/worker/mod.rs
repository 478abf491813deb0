//! Worker pool: the loops that turn pending tasks into outcomes.
//!
//! `pool` holds the per-worker claim/synthesize/commit loop, `reaper` the
//! sweep that reclaims abandoned claims, and [`manager`] the supervision
//! surface (spawn, liveness, shutdown) callers interact with.

pub mod manager;
mod pool;
mod reaper;

pub use manager::{PoolStatus, WorkerManager, WorkerStatus};

use std::sync::Mutex;
use std::time::Instant;

/// Phase of one worker's loop.
///
/// `Idle -> Claiming -> Processing -> {CommittingSuccess | CommittingFailure}
/// -> Idle`; `Stopping` is entered at the next idle transition after a
/// shutdown signal, never mid-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Processing,
    CommittingSuccess,
    CommittingFailure,
    Stopping,
}

/// Shared phase slot, written by the worker and read by the supervisor.
///
/// The supervisor treats a worker that has sat in one busy phase past the
/// visibility timeout (plus margin) as stuck and replaces it.
#[derive(Debug)]
pub struct WorkerHealth {
    inner: Mutex<(WorkerPhase, Instant)>,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((WorkerPhase::Idle, Instant::now())),
        }
    }

    pub(crate) fn transition(&self, phase: WorkerPhase) {
        let mut inner = self.inner.lock().unwrap();
        if inner.0 != phase {
            *inner = (phase, Instant::now());
        }
    }

    /// Current phase and when it was entered.
    pub fn snapshot(&self) -> (WorkerPhase, Instant) {
        *self.inner.lock().unwrap()
    }
}

impl Default for WorkerHealth {
    fn default() -> Self {
        Self::new()
    }
}
