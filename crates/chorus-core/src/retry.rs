//! Retry classification and backoff computation.
//!
//! Everything here is a pure function over the error and the attempt count;
//! the worker loop owns the side effects (requeue or terminal fail). This is
//! the judgment logic of the whole core, so it is kept free of stores,
//! clocks, and I/O.

use std::time::Duration;

use rand::Rng;

use crate::synth::SynthesisError;

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// No retry; the task fails on the spot.
    Fatal,

    /// Short exponential backoff; generic transient trouble.
    RetryableFast,

    /// Long backoff with its own (typically larger) attempt bound;
    /// rate-limit recovery windows dwarf ordinary transient blips.
    RetryableSlow,
}

/// Classify a synthesis failure.
pub fn classify(error: &SynthesisError) -> RetryClass {
    match error {
        SynthesisError::Validation(_) => RetryClass::Fatal,
        SynthesisError::QuotaExhausted(_) => RetryClass::Fatal,
        SynthesisError::Transient(_) => RetryClass::RetryableFast,
        SynthesisError::RateLimited(_) => RetryClass::RetryableSlow,
    }
}

/// Backoff schedule for one retry class.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// A task whose attempt count reaches this bound is failed terminally.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub min_wait: Duration,

    /// Ceiling on the computed delay (jitter excluded).
    pub max_wait: Duration,

    /// Exponential growth factor.
    pub multiplier: f64,

    /// Upper bound of the uniform random perturbation added on top, to keep
    /// workers from retrying in lockstep.
    pub jitter: Duration,
}

impl BackoffPolicy {
    /// Deterministic part of the delay before retry number `attempt`
    /// (1-indexed): `min(max_wait, min_wait * multiplier^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.min_wait.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_wait.as_secs_f64()))
    }

    /// Base delay plus uniform jitter in `[0, jitter]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
        };
        self.base_delay(attempt) + jitter
    }
}

/// Per-class backoff schedules.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub fast: BackoffPolicy,
    pub slow: BackoffPolicy,
}

impl RetryConfig {
    pub fn policy_for(&self, class: RetryClass) -> Option<&BackoffPolicy> {
        match class {
            RetryClass::Fatal => None,
            RetryClass::RetryableFast => Some(&self.fast),
            RetryClass::RetryableSlow => Some(&self.slow),
        }
    }
}

/// The worker's next move for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with the given delay.
    Requeue { delay: Duration, class: RetryClass },

    /// Fail terminally, carrying the last observed error.
    GiveUp { reason: String },
}

/// Decide what to do after attempt number `attempt_count` failed with
/// `error`. Fatal classifications and exhausted attempt bounds give up;
/// everything else requeues with the class's backoff.
pub fn decide(error: &SynthesisError, attempt_count: u32, config: &RetryConfig) -> RetryDecision {
    let class = classify(error);
    let Some(policy) = config.policy_for(class) else {
        return RetryDecision::GiveUp {
            reason: format!("fatal: {error}"),
        };
    };

    if attempt_count >= policy.max_attempts {
        return RetryDecision::GiveUp {
            reason: format!(
                "attempts exhausted ({attempt_count}/{}): {error}",
                policy.max_attempts
            ),
        };
    }

    RetryDecision::Requeue {
        delay: policy.delay(attempt_count),
        class,
    }
}
