//! The worker loop: claim, synthesize, commit.
//!
//! Retry is an explicit state machine here (attempt, classify on failure,
//! compute the delay, requeue or give up) rather than a wrapper around the
//! synthesis call, so every branch is visible and unit-testable.
//!
//! A failure raised by the synthesizer is fully contained in this loop and
//! becomes task state; it never reaches the enqueueing caller. A failure in
//! the store during claiming established no ownership, so the worker just
//! logs it and backs off.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{WorkerHealth, WorkerPhase};
use crate::clock::Clock;
use crate::domain::TaskRecord;
use crate::retry::{RetryConfig, RetryDecision, decide};
use crate::store::TaskStore;
use crate::synth::Synthesizer;

/// Everything a worker needs, shared across the pool.
pub(crate) struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryConfig,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

pub(crate) async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    health: Arc<WorkerHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "worker started");
    loop {
        // Shutdown is honored here, between tasks, never mid-flight.
        if *shutdown.borrow() {
            health.transition(WorkerPhase::Stopping);
            break;
        }

        health.transition(WorkerPhase::Claiming);
        let claimed = match ctx.store.claim_next(ctx.visibility_timeout).await {
            Ok(claimed) => claimed,
            Err(error) => {
                warn!(worker_id, error = %error, "claim failed; backing off");
                health.transition(WorkerPhase::Idle);
                idle_wait(&mut shutdown, ctx.poll_interval).await;
                continue;
            }
        };

        let Some(task) = claimed else {
            health.transition(WorkerPhase::Idle);
            idle_wait(&mut shutdown, ctx.poll_interval).await;
            continue;
        };

        process_one(worker_id, &ctx, &health, task).await;
        health.transition(WorkerPhase::Idle);
    }
    debug!(worker_id, "worker stopped");
}

async fn idle_wait(shutdown: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

async fn process_one(
    worker_id: usize,
    ctx: &WorkerContext,
    health: &WorkerHealth,
    task: TaskRecord,
) {
    debug!(
        worker_id,
        task_id = %task.id,
        attempt = task.attempt_count,
        "processing task"
    );
    health.transition(WorkerPhase::Processing);

    match ctx.synthesizer.synthesize(&task.payload).await {
        Ok(bytes) => {
            health.transition(WorkerPhase::CommittingSuccess);
            info!(
                worker_id,
                task_id = %task.id,
                attempt = task.attempt_count,
                bytes = bytes.len(),
                "task succeeded"
            );
            if let Err(error) = ctx.store.complete(task.id, task.attempt_count, bytes).await {
                // Lease expired and the task moved on without us.
                warn!(worker_id, task_id = %task.id, error = %error, "success commit refused");
            }
        }
        Err(synthesis_error) => {
            health.transition(WorkerPhase::CommittingFailure);
            let failure = synthesis_error.to_failure();

            let commit = match decide(&synthesis_error, task.attempt_count, &ctx.retry) {
                RetryDecision::Requeue { delay, class } => {
                    let requeue_at = ctx.clock.now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero());
                    debug!(
                        worker_id,
                        task_id = %task.id,
                        attempt = task.attempt_count,
                        delay_ms = delay.as_millis() as u64,
                        ?class,
                        "scheduling retry"
                    );
                    ctx.store
                        .fail(task.id, task.attempt_count, failure, Some(requeue_at))
                        .await
                }
                RetryDecision::GiveUp { reason } => {
                    info!(
                        worker_id,
                        task_id = %task.id,
                        attempt = task.attempt_count,
                        reason = %reason,
                        "task failed terminally"
                    );
                    ctx.store
                        .fail(task.id, task.attempt_count, failure, None)
                        .await
                }
            };
            if let Err(error) = commit {
                warn!(worker_id, task_id = %task.id, error = %error, "failure commit refused");
            }
        }
    }
}
