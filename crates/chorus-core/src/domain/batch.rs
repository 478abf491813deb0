//! Batch records: grouping several tasks enqueued together.
//!
//! A batch is bookkeeping only: member tasks are ordinary tasks and workers
//! never see the grouping. Progress is derived from the member records at
//! read time rather than stored as counters, so it cannot drift from task
//! state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BatchId, TaskId, TaskRecord, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub id: BatchId,
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn new(id: BatchId, task_ids: Vec<TaskId>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_ids,
            created_at: now,
        }
    }

    pub fn total(&self) -> u32 {
        self.task_ids.len() as u32
    }
}

/// Aggregate state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    /// No member task has reached a terminal state yet.
    Pending,

    /// Some, but not all, member tasks are terminal.
    Processing,

    /// Every member task is terminal.
    Completed,
}

/// Derived progress view over a batch's member tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub pending: u32,
    pub state: BatchState,
}

impl BatchStatus {
    /// Fold member records into a progress view. Members evicted from the
    /// store (retention lapsed) count as pending; the batch stays
    /// `Processing` rather than inventing an outcome for them.
    pub fn derive<'a, I>(batch: &BatchRecord, members: I) -> Self
    where
        I: IntoIterator<Item = Option<&'a TaskRecord>>,
    {
        let mut completed = 0u32;
        let mut failed = 0u32;
        let mut seen = 0u32;

        for member in members {
            seen += 1;
            match member.map(|t| t.status) {
                Some(TaskStatus::Succeeded) => completed += 1,
                Some(TaskStatus::Failed) => failed += 1,
                _ => {}
            }
        }
        debug_assert_eq!(seen, batch.total());

        let total = batch.total();
        let terminal = completed + failed;
        let state = if terminal == 0 && total > 0 {
            BatchState::Pending
        } else if terminal >= total {
            BatchState::Completed
        } else {
            BatchState::Processing
        };

        Self {
            batch_id: batch.id,
            total,
            completed,
            failed,
            pending: total - terminal,
            state,
        }
    }
}
