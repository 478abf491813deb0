//! Redis-backed store, shared by multiple worker processes.
//!
//! ## Key layout (all under one namespace, default `chorus`)
//!
//! - `{ns}:task:{id}`: task record as JSON, with the retention TTL
//! - `{ns}:pending`: list of claimable ids (RPUSH on enqueue, LMOVE on claim)
//! - `{ns}:processing`: list of in-flight ids
//! - `{ns}:delayed`: zset of ids scored by retry due time (ms)
//! - `{ns}:leases`: zset of in-flight ids scored by lease deadline (ms)
//! - `{ns}:batch:{id}`: batch record as JSON, same TTL
//!
//! Claiming is `LMOVE pending -> processing`: Redis moves one element
//! atomically, so a task currently in flight is never double-delivered. A
//! crashed worker leaves its id in `{ns}:leases`; once the deadline passes,
//! `reap_expired` moves the task back to `pending` and another worker claims
//! it again (at-least-once delivery, no strict cross-process FIFO).
//!
//! The record update that follows a queue operation is a separate command,
//! not a transaction. Ownership is established by the LMOVE / ZREM (both
//! single-winner), so the window only matters if a commit races the reaper
//! at the exact lease boundary, and the attempt fencing token catches that.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use super::{StoreCounts, StoreError, TaskStore};
use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::domain::{BatchId, BatchRecord, TaskFailure, TaskId, TaskRecord, TaskStatus};

const DEFAULT_NAMESPACE: &str = "chorus";

/// How many due retries one claim call promotes at most.
const PROMOTE_CHUNK: usize = 64;

fn backend_err(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct RedisStore {
    connections: Vec<ConnectionManager>,
    next: AtomicUsize,
    clock: Arc<dyn Clock>,
    result_ttl: Duration,
    pending_key: String,
    processing_key: String,
    delayed_key: String,
    leases_key: String,
    task_prefix: String,
    batch_prefix: String,
}

impl RedisStore {
    /// Open `pool_size` multiplexed connections against `config.url`.
    pub async fn connect(
        config: &RedisConfig,
        clock: Arc<dyn Clock>,
        result_ttl: Duration,
    ) -> Result<Self, StoreError> {
        Self::connect_namespaced(config, DEFAULT_NAMESPACE, clock, result_ttl).await
    }

    /// As `connect`, with a custom key namespace (tests run isolated).
    pub async fn connect_namespaced(
        config: &RedisConfig,
        namespace: &str,
        clock: Arc<dyn Clock>,
        result_ttl: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str()).map_err(backend_err)?;

        let pool_size = config.pool_size.max(1);
        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let conn = ConnectionManager::new(client.clone())
                .await
                .map_err(backend_err)?;
            connections.push(conn);
        }
        debug!(pool_size, namespace, "redis store connected");

        Ok(Self {
            connections,
            next: AtomicUsize::new(0),
            clock,
            result_ttl,
            pending_key: format!("{namespace}:pending"),
            processing_key: format!("{namespace}:processing"),
            delayed_key: format!("{namespace}:delayed"),
            leases_key: format!("{namespace}:leases"),
            task_prefix: format!("{namespace}:task:"),
            batch_prefix: format!("{namespace}:batch:"),
        })
    }

    /// Round-robin over the multiplexed connections.
    fn conn(&self) -> ConnectionManager {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[i].clone()
    }

    fn task_key(&self, id: TaskId) -> String {
        format!("{}{}", self.task_prefix, id)
    }

    fn batch_key(&self, id: BatchId) -> String {
        format!("{}{}", self.batch_prefix, id)
    }

    fn ttl_secs(&self) -> u64 {
        self.result_ttl.as_secs().max(1)
    }

    async fn load(
        &self,
        conn: &mut ConnectionManager,
        id: TaskId,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.task_key(id))
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        conn: &mut ConnectionManager,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)?;
        let _: () = redis::cmd("SET")
            .arg(self.task_key(record.id))
            .arg(json)
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    /// Drop an id from the processing list and lease zset.
    async fn release(
        &self,
        conn: &mut ConnectionManager,
        entry: &str,
    ) -> Result<(), StoreError> {
        let _: () = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(entry)
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        let _: () = redis::cmd("ZREM")
            .arg(&self.leases_key)
            .arg(entry)
            .query_async(conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    /// Re-admit due retries to the pending list. ZREM is the single-winner
    /// gate when several processes promote concurrently.
    async fn promote_due(
        &self,
        conn: &mut ConnectionManager,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_CHUNK)
            .query_async(conn)
            .await
            .map_err(backend_err)?;

        for entry in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&entry)
                .query_async(conn)
                .await
                .map_err(backend_err)?;
            if removed == 0 {
                continue; // another process won the promotion
            }

            let Ok(task_id) = entry.parse::<TaskId>() else {
                warn!(entry = %entry, "dropping malformed delayed entry");
                continue;
            };
            if let Some(mut record) = self.load(conn, task_id).await?
                && record.status == TaskStatus::Retrying
            {
                record.requeue(now);
                self.save(conn, &record).await?;
                let _: () = redis::cmd("RPUSH")
                    .arg(&self.pending_key)
                    .arg(&entry)
                    .query_async(conn)
                    .await
                    .map_err(backend_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisStore {
    async fn put(&self, task: TaskRecord) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let json = serde_json::to_string(&task)?;

        // SET NX doubles as the duplicate check.
        let created: Option<String> = redis::cmd("SET")
            .arg(self.task_key(task.id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if created.is_none() {
            return Err(StoreError::DuplicateId(task.id));
        }

        let _: () = redis::cmd("RPUSH")
            .arg(&self.pending_key)
            .arg(task.id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn claim_next(&self, visibility: Duration) -> Result<Option<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let mut conn = self.conn();
        self.promote_due(&mut conn, now).await?;

        loop {
            let entry: Option<String> = redis::cmd("LMOVE")
                .arg(&self.pending_key)
                .arg(&self.processing_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            let Some(entry) = entry else {
                return Ok(None);
            };

            let Ok(task_id) = entry.parse::<TaskId>() else {
                warn!(entry = %entry, "dropping malformed pending entry");
                self.release(&mut conn, &entry).await?;
                continue;
            };

            let Some(mut record) = self.load(&mut conn, task_id).await? else {
                // Record evicted by retention; the entry is dangling.
                self.release(&mut conn, &entry).await?;
                continue;
            };
            if record.status != TaskStatus::Pending {
                self.release(&mut conn, &entry).await?;
                continue;
            }

            let lease_until = now
                + chrono::Duration::from_std(visibility)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
            record.begin_attempt(now, lease_until);
            self.save(&mut conn, &record).await?;

            let _: () = redis::cmd("ZADD")
                .arg(&self.leases_key)
                .arg(lease_until.timestamp_millis())
                .arg(&entry)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            return Ok(Some(record));
        }
    }

    async fn complete(&self, id: TaskId, attempt: u32, result: Vec<u8>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut conn = self.conn();

        let mut record = self
            .load(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if record.status != TaskStatus::InProgress {
            return Err(StoreError::InvalidTransition { id });
        }
        if record.attempt_count != attempt {
            return Err(StoreError::LostClaim { id, attempt });
        }

        record.mark_succeeded(result, now);
        self.save(&mut conn, &record).await?;
        self.release(&mut conn, &id.to_string()).await
    }

    async fn fail(
        &self,
        id: TaskId,
        attempt: u32,
        failure: TaskFailure,
        requeue_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut conn = self.conn();

        let mut record = self
            .load(&mut conn, id)
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if record.status != TaskStatus::InProgress {
            return Err(StoreError::InvalidTransition { id });
        }
        if record.attempt_count != attempt {
            return Err(StoreError::LostClaim { id, attempt });
        }

        let entry = id.to_string();
        match requeue_at {
            Some(due_at) => {
                record.schedule_retry(failure, due_at, now);
                self.save(&mut conn, &record).await?;
                self.release(&mut conn, &entry).await?;
                let _: () = redis::cmd("ZADD")
                    .arg(&self.delayed_key)
                    .arg(due_at.timestamp_millis())
                    .arg(&entry)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_err)?;
            }
            None => {
                record.mark_failed(failure, now);
                self.save(&mut conn, &record).await?;
                self.release(&mut conn, &entry).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let mut conn = self.conn();
        self.load(&mut conn, id).await
    }

    async fn reap_expired(&self) -> Result<Vec<TaskId>, StoreError> {
        let now = self.clock.now();
        let mut conn = self.conn();

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.leases_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;

        let mut reaped = Vec::new();
        for entry in expired {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.leases_key)
                .arg(&entry)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            if removed == 0 {
                continue; // a commit or another reaper got there first
            }

            let _: () = redis::cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(&entry)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;

            let Ok(task_id) = entry.parse::<TaskId>() else {
                warn!(entry = %entry, "dropping malformed lease entry");
                continue;
            };
            if let Some(mut record) = self.load(&mut conn, task_id).await?
                && record.lease_expired(now)
            {
                // Back to pending; another worker will re-claim and the
                // attempt counter grows on that claim.
                record.requeue(now);
                self.save(&mut conn, &record).await?;
                let _: () = redis::cmd("RPUSH")
                    .arg(&self.pending_key)
                    .arg(&entry)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend_err)?;
                reaped.push(task_id);
            }
        }
        Ok(reaped)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let mut conn = self.conn();
        let mut counts = StoreCounts::default();
        let pattern = format!("{}*", self.task_prefix);
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;

            if !keys.is_empty() {
                let mut mget = redis::cmd("MGET");
                for key in &keys {
                    mget.arg(key);
                }
                let values: Vec<Option<String>> =
                    mget.query_async(&mut conn).await.map_err(backend_err)?;
                for json in values.into_iter().flatten() {
                    let record: TaskRecord = serde_json::from_str(&json)?;
                    match record.status {
                        TaskStatus::Pending => counts.pending += 1,
                        TaskStatus::InProgress => counts.in_progress += 1,
                        TaskStatus::Retrying => counts.retrying += 1,
                        TaskStatus::Succeeded => counts.succeeded += 1,
                        TaskStatus::Failed => counts.failed += 1,
                    }
                }
            }

            cursor = next;
            if cursor == 0 {
                return Ok(counts);
            }
        }
    }

    async fn put_batch(&self, batch: BatchRecord) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let json = serde_json::to_string(&batch)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(self.batch_key(batch.id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs())
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if created.is_none() {
            return Err(StoreError::DuplicateBatch(batch.id));
        }
        Ok(())
    }

    async fn get_batch(&self, id: BatchId) -> Result<Option<BatchRecord>, StoreError> {
        let mut conn = self.conn();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.batch_key(id))
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(pong.as_deref(), Ok("PONG"))
    }
}
