//! Failure tags recorded on tasks.
//!
//! `TaskFailure` is what a caller polling a failed task eventually sees: a
//! stable machine-readable kind plus a human-readable message. It is distinct
//! from [`crate::synth::SynthesisError`] (the live error raised by the
//! collaborator) because it has to survive serialization into the durable
//! backend and stay identical across repeated polls.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable classification tag for a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Caller payload was malformed; never retried.
    Validation,

    /// Transient provider/network failure; retried on the fast schedule.
    Transient,

    /// Provider signalled rate limiting; retried on the slow schedule.
    RateLimited,

    /// Provider quota is exhausted; retrying cannot help until it resets.
    QuotaExhausted,

    /// The claim's visibility window lapsed with no commit. Stamped by the
    /// in-process reaper, which has no second process to hand the task to.
    Expired,
}

/// Failure recorded on a task (terminal, or transient while `Retrying`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
