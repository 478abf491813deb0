//! Task lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Transitions:
/// - Pending -> InProgress -> Succeeded
/// - Pending -> InProgress -> Retrying -> Pending (when the backoff elapses)
/// - Pending -> InProgress -> Failed (fatal or attempts exhausted)
///
/// Using an enum keeps matching exhaustive; there is no way to represent a
/// state outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed by a worker.
    Pending,

    /// Claimed; exactly one worker owns it until commit or lease expiry.
    InProgress,

    /// Failed retryably; parked until `next_visible_at`.
    Retrying,

    /// Terminal success; `result` is set.
    Succeeded,

    /// Terminal failure; `error` is set.
    Failed,
}

impl TaskStatus {
    /// No further transitions occur from a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}
