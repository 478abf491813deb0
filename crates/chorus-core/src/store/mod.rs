//! TaskStore port: pluggable persistence behind one contract.
//!
//! Two implementations exist: [`memory::InMemoryStore`] for a single
//! runtime instance and [`redis::RedisStore`] shared across processes. The
//! backend is chosen once at construction and held as `Arc<dyn TaskStore>`;
//! nothing branches on the backend per call.
//!
//! Ownership model: `claim_next` hands out a claim together with the
//! record's (freshly incremented) `attempt_count`. `complete` and `fail`
//! echo that count back as a fencing token and are rejected with
//! [`StoreError::LostClaim`] when it no longer matches, so a worker that
//! outlived its visibility window cannot commit over a re-claimed task.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::domain::{BatchId, BatchRecord, TaskFailure, TaskId, TaskRecord};

pub use memory::InMemoryStore;
pub use redis::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate id: {0}")]
    DuplicateId(TaskId),

    #[error("duplicate batch id: {0}")]
    DuplicateBatch(BatchId),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The fencing token no longer matches: the claim expired and the task
    /// was re-admitted (and possibly re-claimed) in the meantime.
    #[error("claim lost for task {id}: attempt {attempt} is stale")]
    LostClaim { id: TaskId, attempt: u32 },

    /// Commit attempted against a task that is not `InProgress`.
    #[error("invalid transition for task {id}: not in progress")]
    InvalidTransition { id: TaskId },

    /// The backend itself is unreachable or misbehaving. Surfaced directly
    /// to whichever operation invoked it.
    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("record corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Gauge of tasks by lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub retrying: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Persistence contract shared by both backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Rejects an id that already exists.
    async fn put(&self, task: TaskRecord) -> Result<(), StoreError>;

    /// Atomically select one claimable task (`Pending`, visible now), mark
    /// it `InProgress` for `visibility`, bump its attempt count, and return
    /// a copy. Due retries are re-admitted first. `None` when nothing is
    /// eligible; callers poll.
    async fn claim_next(&self, visibility: Duration) -> Result<Option<TaskRecord>, StoreError>;

    /// Commit success for a claim identified by its fencing token.
    async fn complete(&self, id: TaskId, attempt: u32, result: Vec<u8>) -> Result<(), StoreError>;

    /// Commit failure. With `requeue_at`, the task parks as `Retrying` and
    /// becomes claimable once the delay elapses; without, it fails
    /// terminally.
    async fn fail(
        &self,
        id: TaskId,
        attempt: u32,
        failure: TaskFailure,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Read-only lookup, any status.
    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Sweep expired `InProgress` claims. The shared backend re-admits them
    /// to `Pending` (another worker will re-claim); the in-process backend
    /// force-fails them, since no second owner exists to take over. Returns
    /// the affected ids.
    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    async fn put_batch(&self, batch: BatchRecord) -> Result<(), StoreError>;

    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError>;

    /// Backend reachable and responsive?
    async fn health_check(&self) -> bool;
}
