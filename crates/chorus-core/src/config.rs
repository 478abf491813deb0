//! Configuration value objects.
//!
//! Values only; loading (env, files) is the embedding application's
//! business. One `QueueConfig` is built once and passed by reference into
//! `QueueService::connect` and `WorkerManager::new`; there is no ambient
//! global to reach for.

use std::time::Duration;

use crate::retry::{BackoffPolicy, RetryConfig};

/// Backend selection, decided once at construction.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// In-process store; visible only within one runtime instance.
    InProcess,

    /// Shared Redis store reachable by multiple worker processes.
    Redis(RedisConfig),
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,

    /// Number of multiplexed connections kept open.
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Fixed worker pool size.
    pub workers: usize,

    /// Claim lease length; sized to the synthesizer's worst-case latency
    /// plus margin.
    pub visibility_timeout: Duration,

    /// Idle sleep between empty claim polls.
    pub poll_interval: Duration,

    /// How often the reaper sweeps for expired leases.
    pub reap_interval: Duration,

    /// How often the supervisor checks worker liveness.
    pub liveness_interval: Duration,

    pub retry: RetryConfig,

    /// Retention window for finished records (durable backend TTL).
    pub result_ttl: Duration,

    pub backend: BackendConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(15),
            retry: RetryConfig {
                fast: BackoffPolicy {
                    max_attempts: 3,
                    min_wait: Duration::from_secs(4),
                    max_wait: Duration::from_secs(10),
                    multiplier: 2.0,
                    jitter: Duration::from_millis(500),
                },
                slow: BackoffPolicy {
                    max_attempts: 5,
                    min_wait: Duration::from_secs(15),
                    max_wait: Duration::from_secs(120),
                    multiplier: 2.0,
                    jitter: Duration::from_secs(2),
                },
            },
            result_ttl: Duration::from_secs(3600),
            backend: BackendConfig::InProcess,
        }
    }
}
