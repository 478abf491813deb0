//! QueueService: the caller-facing surface.
//!
//! Enqueueing never performs synthesis; it persists a `Pending` record and
//! returns the id. Polling never blocks; a task still in flight reports
//! [`TaskPoll::Pending`] and callers retry on their own schedule.
//!
//! The backend is selected exactly once, in [`QueueService::connect`], and
//! held as a trait object from then on. Dropping the service releases the
//! backend connections on every exit path.

use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{BackendConfig, QueueConfig};
use crate::domain::{
    BatchId, BatchRecord, BatchStatus, TaskFailure, TaskId, TaskRecord, TaskStatus,
};
use crate::store::{InMemoryStore, RedisStore, StoreCounts, StoreError, TaskStore};

/// Poll outcome for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    /// Not terminal yet; ask again later.
    Pending,

    /// Terminal success with the synthesized bytes.
    Succeeded(Vec<u8>),

    /// Terminal failure with its stable tag and message.
    Failed(TaskFailure),
}

pub struct QueueService {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl QueueService {
    /// Build against the configured backend.
    pub async fn connect(config: &QueueConfig) -> Result<Self, StoreError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store: Arc<dyn TaskStore> = match &config.backend {
            BackendConfig::InProcess => {
                info!("queue service using in-process store");
                Arc::new(InMemoryStore::new(clock.clone()))
            }
            BackendConfig::Redis(redis) => {
                info!(url = %redis.url, "queue service using redis store");
                Arc::new(RedisStore::connect(redis, clock.clone(), config.result_ttl).await?)
            }
        };
        Ok(Self { store, clock })
    }

    /// Build over an existing store (tests inject fakes or shared stores).
    pub fn with_store(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub(crate) fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Persist a new task and return its id immediately.
    pub async fn enqueue(&self, payload: serde_json::Value) -> Result<TaskId, StoreError> {
        let id = TaskId::generate();
        let task = TaskRecord::new(id, payload, self.clock.now());
        self.store.put(task).await?;
        info!(task_id = %id, "task enqueued");
        Ok(id)
    }

    /// Enqueue several payloads under one batch handle.
    pub async fn enqueue_batch(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<BatchId, StoreError> {
        let now = self.clock.now();
        let batch_id = BatchId::generate();

        let mut task_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let id = TaskId::generate();
            let task = TaskRecord::new(id, payload, now).in_batch(batch_id);
            self.store.put(task).await?;
            task_ids.push(id);
        }

        let count = task_ids.len();
        self.store
            .put_batch(BatchRecord::new(batch_id, task_ids, now))
            .await?;
        info!(batch_id = %batch_id, tasks = count, "batch enqueued");
        Ok(batch_id)
    }

    pub async fn get_status(&self, id: TaskId) -> Result<TaskStatus, StoreError> {
        let task = self.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
        Ok(task.status)
    }

    /// Terminal outcome if available, pending marker otherwise. Repeated
    /// calls on a terminal task return the identical answer.
    pub async fn get_result(&self, id: TaskId) -> Result<TaskPoll, StoreError> {
        let task = self.store.get(id).await?.ok_or(StoreError::NotFound(id))?;
        Ok(match task.status {
            TaskStatus::Succeeded => TaskPoll::Succeeded(task.result.unwrap_or_default()),
            TaskStatus::Failed => TaskPoll::Failed(task.error.unwrap_or_else(|| {
                TaskFailure::new(
                    crate::domain::FailureKind::Transient,
                    "failure detail unavailable",
                )
            })),
            _ => TaskPoll::Pending,
        })
    }

    /// Progress view derived from the batch's member tasks.
    pub async fn get_batch_status(&self, id: BatchId) -> Result<Option<BatchStatus>, StoreError> {
        let Some(batch) = self.store.get_batch(id).await? else {
            return Ok(None);
        };

        let mut members = Vec::with_capacity(batch.task_ids.len());
        for task_id in &batch.task_ids {
            members.push(self.store.get(*task_id).await?);
        }
        let views = members.iter().map(|m| m.as_ref());
        Ok(Some(BatchStatus::derive(&batch, views)))
    }

    pub async fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.store.counts().await
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::FailureKind;
    use std::time::Duration;

    fn service() -> (QueueService, Arc<dyn TaskStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::from_system());
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryStore::new(clock.clone()));
        let service = QueueService::with_store(store.clone(), clock.clone());
        (service, store, clock)
    }

    #[tokio::test]
    async fn enqueue_returns_distinct_ids_and_pending_status() {
        let (service, _, _) = service();

        let a = service.enqueue(serde_json::json!({"text": "a"})).await.unwrap();
        let b = service.enqueue(serde_json::json!({"text": "b"})).await.unwrap();
        assert_ne!(a, b);

        assert_eq!(service.get_status(a).await.unwrap(), TaskStatus::Pending);
        assert_eq!(service.get_result(a).await.unwrap(), TaskPoll::Pending);
    }

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let (service, _, _) = service();
        let err = service.get_status(TaskId::generate()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminal_result_is_idempotent() {
        let (service, store, _) = service();
        let id = service.enqueue(serde_json::json!({})).await.unwrap();

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store
            .complete(claimed.id, claimed.attempt_count, vec![42])
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(
                service.get_result(id).await.unwrap(),
                TaskPoll::Succeeded(vec![42])
            );
        }
    }

    #[tokio::test]
    async fn failed_result_carries_the_stable_tag() {
        let (service, store, _) = service();
        let id = service.enqueue(serde_json::json!({})).await.unwrap();

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store
            .fail(
                claimed.id,
                claimed.attempt_count,
                TaskFailure::new(FailureKind::RateLimited, "429 from provider"),
                None,
            )
            .await
            .unwrap();

        match service.get_result(id).await.unwrap() {
            TaskPoll::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::RateLimited);
                assert!(failure.message.contains("429"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_status_tracks_member_tasks() {
        let (service, store, _) = service();
        let batch_id = service
            .enqueue_batch(vec![
                serde_json::json!({"text": "one"}),
                serde_json::json!({"text": "two"}),
            ])
            .await
            .unwrap();

        let status = service.get_batch_status(batch_id).await.unwrap().unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.state, crate::domain::BatchState::Pending);

        let claimed = store
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store
            .complete(claimed.id, claimed.attempt_count, vec![])
            .await
            .unwrap();

        let status = service.get_batch_status(batch_id).await.unwrap().unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.state, crate::domain::BatchState::Processing);
    }

    #[tokio::test]
    async fn missing_batch_is_none() {
        let (service, _, _) = service();
        assert!(
            service
                .get_batch_status(BatchId::generate())
                .await
                .unwrap()
                .is_none()
        );
    }
}
