//! In-process store: one mutex over a record map plus two indexes.
//!
//! - `pending` is a FIFO of ids, so claims are O(1) and scan in insertion
//!   order (no starvation).
//! - `delayed` is a min-heap of (due time, id); due entries are promoted
//!   back to `pending` at the top of every claim.
//!
//! The mutex is the single synchronization boundary: no two concurrent
//! callers can claim the same task because the pop/mark pair happens under
//! one lock.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{StoreCounts, StoreError, TaskStore};
use crate::clock::Clock;
use crate::domain::{
    BatchId, BatchRecord, FailureKind, TaskFailure, TaskId, TaskRecord, TaskStatus,
};

/// Delayed-retry entry. `Ord` is reversed on the due time so the
/// `BinaryHeap` behaves as a min-heap (earliest due first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    due_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

#[derive(Default)]
struct State {
    records: HashMap<TaskId, TaskRecord>,
    pending: VecDeque<TaskId>,
    delayed: BinaryHeap<DelayedEntry>,
    batches: HashMap<BatchId, BatchRecord>,
}

impl State {
    /// Move due `Retrying` tasks back to the pending FIFO.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.delayed.peek() {
            if entry.due_at > now {
                break; // heap is ordered; nothing further is due
            }
            let entry = self.delayed.pop().expect("peeked entry exists");
            if let Some(record) = self.records.get_mut(&entry.task_id)
                && record.status == TaskStatus::Retrying
            {
                record.requeue(now);
                self.pending.push_back(entry.task_id);
            }
        }
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn put(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&task.id) {
            return Err(StoreError::DuplicateId(task.id));
        }
        let id = task.id;
        state.records.insert(id, task);
        state.pending.push_back(id);
        Ok(())
    }

    async fn claim_next(&self, visibility: Duration) -> Result<Option<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.promote_due(now);

        // Skip stale index entries; the record map is the source of truth.
        while let Some(task_id) = state.pending.pop_front() {
            if let Some(record) = state.records.get_mut(&task_id)
                && record.is_claimable(now)
            {
                let lease_until = now
                    + chrono::Duration::from_std(visibility)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                record.begin_attempt(now, lease_until);
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: TaskId, attempt: u32, result: Vec<u8>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if record.status != TaskStatus::InProgress {
            return Err(StoreError::InvalidTransition { id });
        }
        if record.attempt_count != attempt {
            return Err(StoreError::LostClaim { id, attempt });
        }
        record.mark_succeeded(result, now);
        Ok(())
    }

    async fn fail(
        &self,
        id: TaskId,
        attempt: u32,
        failure: TaskFailure,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if record.status != TaskStatus::InProgress {
            return Err(StoreError::InvalidTransition { id });
        }
        if record.attempt_count != attempt {
            return Err(StoreError::LostClaim { id, attempt });
        }

        match requeue_at {
            Some(due_at) => {
                record.schedule_retry(failure, due_at, now);
                state.delayed.push(DelayedEntry {
                    due_at,
                    task_id: id,
                });
            }
            None => record.mark_failed(failure, now),
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let expired: Vec<TaskId> = state
            .records
            .values()
            .filter(|r| r.lease_expired(now))
            .map(|r| r.id)
            .collect();

        // No reclaiming owner exists in-process; the task is dead.
        for id in &expired {
            if let Some(record) = state.records.get_mut(id) {
                let attempts = record.attempt_count;
                record.mark_failed(
                    TaskFailure::new(
                        FailureKind::Expired,
                        format!("visibility timeout expired after {attempts} attempt(s)"),
                    ),
                    now,
                );
            }
        }
        Ok(expired)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = StoreCounts::default();
        for record in state.records.values() {
            match record.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Retrying => counts.retrying += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn put_batch(&self, batch: BatchRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::DuplicateBatch(batch.id));
        }
        state.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.batches.get(&id).cloned())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<InMemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_system());
        let store = Arc::new(InMemoryStore::new(clock.clone()));
        (store, clock)
    }

    fn task(clock: &ManualClock) -> TaskRecord {
        TaskRecord::new(
            TaskId::generate(),
            serde_json::json!({"text": "hello"}),
            clock.now(),
        )
    }

    const VISIBILITY: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn put_rejects_duplicate_ids() {
        let (store, clock) = store();
        let record = task(&clock);

        store.put(record.clone()).await.unwrap();
        let err = store.put(record).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
    }

    #[tokio::test]
    async fn claims_come_out_in_insertion_order() {
        let (store, clock) = store();
        let first = task(&clock);
        let second = task(&clock);
        store.put(first.clone()).await.unwrap();
        store.put(second.clone()).await.unwrap();

        let a = store.claim_next(VISIBILITY).await.unwrap().unwrap();
        let b = store.claim_next(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(a.attempt_count, 1);

        assert!(store.claim_next(VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_sets_result_once() {
        let (store, clock) = store();
        store.put(task(&clock)).await.unwrap();

        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();
        store
            .complete(claimed.id, claimed.attempt_count, vec![7, 8, 9])
            .await
            .unwrap();

        let stored = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert_eq!(stored.result.as_deref(), Some(&[7u8, 8, 9][..]));

        // A second commit is rejected; the result is never overwritten.
        let err = store
            .complete(claimed.id, claimed.attempt_count, vec![0])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn stale_attempt_token_is_rejected() {
        let (store, clock) = store();
        store.put(task(&clock)).await.unwrap();
        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();

        let err = store
            .complete(claimed.id, claimed.attempt_count + 1, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LostClaim { .. }));
    }

    #[tokio::test]
    async fn retry_becomes_claimable_after_the_delay() {
        let (store, clock) = store();
        store.put(task(&clock)).await.unwrap();
        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();

        let due = clock.now() + chrono::Duration::seconds(8);
        store
            .fail(
                claimed.id,
                claimed.attempt_count,
                TaskFailure::new(FailureKind::Transient, "503"),
                Some(due),
            )
            .await
            .unwrap();

        let parked = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(parked.status, TaskStatus::Retrying);
        assert!(parked.error.is_some());

        // Not yet due.
        assert!(store.claim_next(VISIBILITY).await.unwrap().is_none());

        clock.advance(Duration::from_secs(8));
        let reclaimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempt_count, 2);
        assert!(reclaimed.error.is_none());
    }

    #[tokio::test]
    async fn terminal_fail_keeps_the_error() {
        let (store, clock) = store();
        store.put(task(&clock)).await.unwrap();
        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();

        store
            .fail(
                claimed.id,
                claimed.attempt_count,
                TaskFailure::new(FailureKind::Validation, "empty text"),
                None,
            )
            .await
            .unwrap();

        let stored = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_ref().unwrap().kind, FailureKind::Validation);
    }

    #[tokio::test]
    async fn expired_lease_is_force_failed() {
        let (store, clock) = store();
        store.put(task(&clock)).await.unwrap();
        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();

        // Nothing expired yet.
        assert!(store.reap_expired().await.unwrap().is_empty());

        clock.advance(VISIBILITY + Duration::from_secs(1));
        let reaped = store.reap_expired().await.unwrap();
        assert_eq!(reaped, vec![claimed.id]);

        let stored = store.get(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_ref().unwrap().kind, FailureKind::Expired);

        // The owner's late commit is now rejected.
        let err = store
            .complete(claimed.id, claimed.attempt_count, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn counts_track_lifecycle_states() {
        let (store, clock) = store();
        for _ in 0..3 {
            store.put(task(&clock)).await.unwrap();
        }
        let claimed = store.claim_next(VISIBILITY).await.unwrap().unwrap();
        store
            .complete(claimed.id, claimed.attempt_count, vec![])
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_task() {
        let clock: Arc<dyn Clock> = Arc::new(crate::clock::SystemClock);
        let store = Arc::new(InMemoryStore::new(clock));

        const TASKS: usize = 100;
        const CLAIMERS: usize = 8;

        for _ in 0..TASKS {
            store
                .put(TaskRecord::new(
                    TaskId::generate(),
                    serde_json::json!({}),
                    Utc::now(),
                ))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..CLAIMERS {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(task) = store.claim_next(VISIBILITY).await.unwrap() {
                    claimed.push(task.id);
                }
                claimed
            }));
        }

        let mut all: Vec<TaskId> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        assert_eq!(all.len(), TASKS);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), TASKS, "a task was claimed twice");
    }
}
