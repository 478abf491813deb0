//! WorkerManager: the one component callers start and stop.
//!
//! Spawns `N` workers against a shared `QueueService`, runs the reaper and a
//! supervisor tick, and shuts the pool down cooperatively. The service and
//! synthesizer are injected, so the whole core runs against fakes in tests
//! with no external dependency.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::pool::{WorkerContext, worker_loop};
use super::reaper::reaper_loop;
use super::{WorkerHealth, WorkerPhase};
use crate::config::QueueConfig;
use crate::service::QueueService;
use crate::synth::Synthesizer;

/// One worker slot: health slot plus the join handle, replaced in place when
/// the supervisor declares the worker stuck.
struct WorkerSlot {
    id: usize,
    health: Arc<WorkerHealth>,
    join: JoinHandle<()>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    reaper: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

/// Snapshot of one worker for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: usize,
    pub phase: WorkerPhase,
}

/// Snapshot of the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    pub fn total(&self) -> usize {
        self.workers.len()
    }

    /// Workers not yet winding down.
    pub fn active(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.phase != WorkerPhase::Stopping)
            .count()
    }
}

pub struct WorkerManager {
    ctx: Arc<WorkerContext>,
    workers: usize,
    reap_interval: Duration,
    liveness_interval: Duration,
    /// A worker sitting in one busy phase this long is presumed stuck.
    stuck_after: Duration,
    slots: Arc<Mutex<Vec<WorkerSlot>>>,
    running: Mutex<Option<Running>>,
}

impl WorkerManager {
    pub fn new(
        service: &QueueService,
        synthesizer: Arc<dyn Synthesizer>,
        config: &QueueConfig,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            store: service.store(),
            synthesizer,
            clock: service.clock(),
            retry: config.retry.clone(),
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval,
        });
        Self {
            ctx,
            workers: config.workers,
            reap_interval: config.reap_interval,
            liveness_interval: config.liveness_interval,
            stuck_after: config.visibility_timeout + config.liveness_interval,
            slots: Arc::new(Mutex::new(Vec::new())),
            running: Mutex::new(None),
        }
    }

    /// Spawn the pool, the reaper, and the supervisor. No-op when already
    /// running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            warn!("worker manager already started");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut slots = self.slots.lock().unwrap();
            for worker_id in 0..self.workers {
                slots.push(spawn_worker(worker_id, &self.ctx, &shutdown_rx));
            }
        }

        let reaper = tokio::spawn(reaper_loop(
            self.ctx.store.clone(),
            self.reap_interval,
            shutdown_rx.clone(),
        ));
        let supervisor = tokio::spawn(supervisor_loop(
            self.slots.clone(),
            self.ctx.clone(),
            self.stuck_after,
            self.liveness_interval,
            shutdown_rx,
        ));

        info!(workers = self.workers, "worker manager started");
        *running = Some(Running {
            shutdown_tx,
            reaper,
            supervisor,
        });
    }

    /// Stop the pool. Graceful: the signal is observed between tasks, so
    /// in-flight synthesis finishes and commits before the worker exits.
    /// Non-graceful: workers are aborted where they stand.
    pub async fn stop(&self, graceful: bool) {
        let running = self.running.lock().unwrap().take();
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        let slots: Vec<WorkerSlot> = {
            let mut slots = self.slots.lock().unwrap();
            slots.drain(..).collect()
        };

        if !graceful {
            for slot in &slots {
                slot.join.abort();
            }
            running.reaper.abort();
            running.supervisor.abort();
        }
        for slot in slots {
            let _ = slot.join.await;
        }
        let _ = running.reaper.await;
        let _ = running.supervisor.await;
        info!(graceful, "worker manager stopped");
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.slots.lock().unwrap();
        PoolStatus {
            workers: slots
                .iter()
                .map(|slot| WorkerStatus {
                    id: slot.id,
                    phase: slot.health.snapshot().0,
                })
                .collect(),
        }
    }
}

fn spawn_worker(
    worker_id: usize,
    ctx: &Arc<WorkerContext>,
    shutdown_rx: &watch::Receiver<bool>,
) -> WorkerSlot {
    let health = Arc::new(WorkerHealth::new());
    let join = tokio::spawn(worker_loop(
        worker_id,
        ctx.clone(),
        health.clone(),
        shutdown_rx.clone(),
    ));
    WorkerSlot {
        id: worker_id,
        health,
        join,
    }
}

/// Liveness tick: replace workers that stalled mid-phase or died.
async fn supervisor_loop(
    slots: Arc<Mutex<Vec<WorkerSlot>>>,
    ctx: Arc<WorkerContext>,
    stuck_after: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                let mut slots = slots.lock().unwrap();
                for slot in slots.iter_mut() {
                    let (phase, entered) = slot.health.snapshot();
                    let busy = matches!(
                        phase,
                        WorkerPhase::Processing
                            | WorkerPhase::CommittingSuccess
                            | WorkerPhase::CommittingFailure
                    );

                    if busy && entered.elapsed() > stuck_after {
                        warn!(worker_id = slot.id, ?phase, "worker stuck; replacing");
                        slot.join.abort();
                        *slot = spawn_worker(slot.id, &ctx, &shutdown);
                    } else if slot.join.is_finished() && !*shutdown.borrow() {
                        // The loop only returns on shutdown; a finished
                        // handle here means the worker panicked.
                        warn!(worker_id = slot.id, "worker died; replacing");
                        *slot = spawn_worker(slot.id, &ctx, &shutdown);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::QueueConfig;
    use crate::retry::{BackoffPolicy, RetryConfig};
    use crate::store::InMemoryStore;
    use crate::synth::{SynthesisError, Synthesizer};
    use async_trait::async_trait;

    struct AlwaysOk;

    #[async_trait]
    impl Synthesizer for AlwaysOk {
        async fn synthesize(
            &self,
            _payload: &serde_json::Value,
        ) -> Result<Vec<u8>, SynthesisError> {
            Ok(vec![0xAA])
        }
    }

    fn fast_config(workers: usize) -> QueueConfig {
        QueueConfig {
            workers,
            visibility_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            reap_interval: Duration::from_millis(50),
            liveness_interval: Duration::from_millis(50),
            retry: RetryConfig {
                fast: BackoffPolicy {
                    max_attempts: 3,
                    min_wait: Duration::from_millis(10),
                    max_wait: Duration::from_millis(40),
                    multiplier: 2.0,
                    jitter: Duration::ZERO,
                },
                slow: BackoffPolicy {
                    max_attempts: 2,
                    min_wait: Duration::from_millis(20),
                    max_wait: Duration::from_millis(80),
                    multiplier: 2.0,
                    jitter: Duration::ZERO,
                },
            },
            ..QueueConfig::default()
        }
    }

    fn service() -> QueueService {
        let clock = Arc::new(SystemClock);
        QueueService::with_store(Arc::new(InMemoryStore::new(clock.clone())), clock)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_is_idempotent_and_stop_clears_the_pool() {
        let service = service();
        let manager = WorkerManager::new(&service, Arc::new(AlwaysOk), &fast_config(2));

        manager.start();
        manager.start(); // warns, does not double-spawn
        assert_eq!(manager.status().total(), 2);

        manager.stop(true).await;
        assert_eq!(manager.status().total(), 0);

        // Stopping twice is harmless.
        manager.stop(true).await;
    }

    /// Hangs forever when the payload says so; the reaper and supervisor
    /// have to deal with it.
    struct HangOnFlag;

    #[async_trait]
    impl Synthesizer for HangOnFlag {
        async fn synthesize(
            &self,
            payload: &serde_json::Value,
        ) -> Result<Vec<u8>, SynthesisError> {
            if payload["hang"].as_bool().unwrap_or(false) {
                std::future::pending::<()>().await;
            }
            Ok(vec![9])
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hung_worker_is_reaped_and_replaced() {
        let service = service();
        let config = QueueConfig {
            visibility_timeout: Duration::from_millis(100),
            ..fast_config(1)
        };
        let manager = WorkerManager::new(&service, Arc::new(HangOnFlag), &config);
        manager.start();

        let hung = service.enqueue(serde_json::json!({"hang": true})).await.unwrap();

        // The lease lapses, the in-process reaper force-fails the task.
        for _ in 0..200 {
            if service.get_status(hung).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        match service.get_result(hung).await.unwrap() {
            crate::service::TaskPoll::Failed(failure) => {
                assert_eq!(failure.kind, crate::domain::FailureKind::Expired);
            }
            other => panic!("expected expiry failure, got {other:?}"),
        }

        // The supervisor replaces the stuck worker, so new work still runs.
        let next = service.enqueue(serde_json::json!({"hang": false})).await.unwrap();
        for _ in 0..200 {
            if service.get_status(next).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            service.get_status(next).await.unwrap(),
            crate::domain::TaskStatus::Succeeded
        );
        assert_eq!(manager.status().total(), 1);

        manager.stop(false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn non_graceful_stop_aborts_an_in_flight_task() {
        let service = service();
        let config = QueueConfig {
            // Long lease and lazy supervision: nothing rescues the hang.
            visibility_timeout: Duration::from_secs(60),
            liveness_interval: Duration::from_secs(60),
            reap_interval: Duration::from_secs(60),
            ..fast_config(1)
        };
        let manager = WorkerManager::new(&service, Arc::new(HangOnFlag), &config);
        manager.start();

        let hung = service.enqueue(serde_json::json!({"hang": true})).await.unwrap();
        // Give the worker time to claim it.
        for _ in 0..100 {
            if service.get_status(hung).await.unwrap() == crate::domain::TaskStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Must return promptly despite the hung synthesis call.
        tokio::time::timeout(Duration::from_secs(5), manager.stop(false))
            .await
            .expect("non-graceful stop should not wait on the hang");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_stop_finishes_the_in_flight_task() {
        let service = service();
        let manager = WorkerManager::new(&service, Arc::new(AlwaysOk), &fast_config(1));
        manager.start();

        let id = service.enqueue(serde_json::json!({"text": "x"})).await.unwrap();

        // Wait for the worker to pick it up and finish.
        for _ in 0..200 {
            if service.get_status(id).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        manager.stop(true).await;

        assert_eq!(
            service.get_status(id).await.unwrap(),
            crate::domain::TaskStatus::Succeeded
        );
    }
}
