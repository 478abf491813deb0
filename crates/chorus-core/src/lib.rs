//! chorus-core
//!
//! Asynchronous task-queue / worker-pool core for deferred remote audio
//! synthesis. Callers enqueue an opaque synthesis payload and immediately get
//! a [`domain::TaskId`] back; a bounded pool of workers performs the actual
//! (slow, rate-limited, failure-prone) provider call, retries transient
//! failures with backoff, and records the outcome for later polling.
//!
//! # Module map
//! - **domain**: task records, lifecycle states, ids, failure tags, batches
//! - **store**: the `TaskStore` port with in-process and Redis backends
//! - **retry**: failure classification and backoff computation (pure)
//! - **synth**: the external `Synthesizer` port this core drives
//! - **service**: caller-facing `QueueService` (enqueue / poll / health)
//! - **worker**: worker loop, reaper loop, and the `WorkerManager`
//!
//! The crate never installs a tracing subscriber or reads the environment;
//! all configuration arrives through [`config::QueueConfig`].

pub mod clock;
pub mod config;
pub mod domain;
pub mod retry;
pub mod service;
pub mod store;
pub mod synth;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendConfig, QueueConfig, RedisConfig};
pub use domain::{
    BatchId, BatchRecord, BatchState, BatchStatus, FailureKind, TaskFailure, TaskId, TaskRecord,
    TaskStatus,
};
pub use retry::{BackoffPolicy, RetryClass, RetryConfig, RetryDecision, classify, decide};
pub use service::{QueueService, TaskPoll};
pub use store::{StoreCounts, StoreError, TaskStore};
pub use synth::{SynthesisError, Synthesizer};
pub use worker::{PoolStatus, WorkerManager, WorkerPhase, WorkerStatus};
