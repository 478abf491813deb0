//! Task record: the single source of truth for one unit of work.
//!
//! Design: all state transitions happen through methods here; stores hold
//! records and index structures (FIFO queue, delay heap) that only ever carry
//! ids. Timestamps are `DateTime<Utc>` rather than `Instant` because the
//! durable backend serializes whole records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BatchId, TaskFailure, TaskId, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,

    /// Opaque synthesis request; immutable once enqueued.
    pub payload: serde_json::Value,

    pub status: TaskStatus,

    /// Times a worker has begun processing this task.
    pub attempt_count: u32,

    /// Synthesized bytes; written exactly once, on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Vec<u8>>,

    /// Present when `Failed`, and transiently while `Retrying`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,

    /// Set when the task was enqueued as part of a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the task next becomes eligible for claiming: the retry due time
    /// while `Retrying`, the lease deadline while `InProgress`.
    pub next_visible_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(id: TaskId, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            status: TaskStatus::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            batch_id: None,
            created_at: now,
            updated_at: now,
            next_visible_at: now,
        }
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Is this task claimable at `now`?
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_visible_at <= now
    }

    /// Has the `InProgress` lease lapsed at `now`?
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InProgress && self.next_visible_at <= now
    }

    /// Claim: Pending -> InProgress, bump the attempt counter, stamp the
    /// lease deadline.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, lease_until: DateTime<Utc>) {
        self.status = TaskStatus::InProgress;
        self.attempt_count += 1;
        self.next_visible_at = lease_until;
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, result: Vec<u8>, now: DateTime<Utc>) {
        self.status = TaskStatus::Succeeded;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, failure: TaskFailure, now: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = Some(failure);
        self.updated_at = now;
    }

    /// Park for a delayed retry: InProgress -> Retrying, due at `requeue_at`.
    pub fn schedule_retry(
        &mut self,
        failure: TaskFailure,
        requeue_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.status = TaskStatus::Retrying;
        self.error = Some(failure);
        self.next_visible_at = requeue_at;
        self.updated_at = now;
    }

    /// Re-admit to the pending queue (retry due, or lease reclaimed).
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.error = None;
        self.next_visible_at = now;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FailureKind;
    use chrono::Duration as ChronoDuration;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::new(TaskId::generate(), serde_json::json!({"text": "hi"}), now)
    }

    #[test]
    fn new_task_is_immediately_claimable() {
        let now = Utc::now();
        let task = record(now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.is_claimable(now));
    }

    #[test]
    fn begin_attempt_claims_and_counts() {
        let now = Utc::now();
        let mut task = record(now);
        let lease_until = now + ChronoDuration::seconds(300);

        task.begin_attempt(now, lease_until);

        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.attempt_count, 1);
        assert!(!task.is_claimable(now));
        assert!(!task.lease_expired(now));
        assert!(task.lease_expired(lease_until));
    }

    #[test]
    fn retry_parks_until_due_then_requeue_clears_error() {
        let now = Utc::now();
        let mut task = record(now);
        task.begin_attempt(now, now + ChronoDuration::seconds(300));

        let due = now + ChronoDuration::seconds(8);
        task.schedule_retry(
            TaskFailure::new(FailureKind::Transient, "connection reset"),
            due,
            now,
        );
        assert_eq!(task.status, TaskStatus::Retrying);
        assert!(task.error.is_some());
        assert!(!task.is_claimable(due));

        task.requeue(due);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.error.is_none());
        assert!(task.is_claimable(due));
    }

    #[test]
    fn success_clears_error_and_sets_result() {
        let now = Utc::now();
        let mut task = record(now);
        task.begin_attempt(now, now + ChronoDuration::seconds(300));
        task.mark_succeeded(vec![1, 2, 3], now);

        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.as_deref(), Some(&[1u8, 2, 3][..]));
        assert!(task.error.is_none());
        assert!(task.status.is_terminal());
    }
}
