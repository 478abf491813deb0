//! Synthesizer port: the external collaborator this core drives.
//!
//! The provider call is the sole suspension point of a worker and the
//! dominant latency cost. The contract is deliberately narrow: one call,
//! binary result, four distinguishable failure categories, bounded execution
//! time (callers size the visibility timeout to the provider's worst case
//! plus margin).

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{FailureKind, TaskFailure};

/// Failure raised by the synthesis collaborator.
#[derive(Debug, Clone, Error)]
pub enum SynthesisError {
    /// The request payload is malformed or rejected outright (bad voice
    /// name, empty text, authentication refused). Retrying cannot help.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Transient network/server trouble; a prompt retry usually succeeds.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The provider is rate-limiting us; back off well past the usual
    /// transient window before trying again.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Quota is exhausted until some external reset; not our call to wait
    /// for.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),
}

impl SynthesisError {
    /// The stable tag this error is recorded under.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SynthesisError::Validation(_) => FailureKind::Validation,
            SynthesisError::Transient(_) => FailureKind::Transient,
            SynthesisError::RateLimited(_) => FailureKind::RateLimited,
            SynthesisError::QuotaExhausted(_) => FailureKind::QuotaExhausted,
        }
    }

    pub fn to_failure(&self) -> TaskFailure {
        TaskFailure::new(self.failure_kind(), self.to_string())
    }
}

/// External synthesis collaborator.
///
/// Implementations must be idempotent enough to tolerate at-least-once
/// invocation: a re-claimed task may reach the provider twice.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize audio for an opaque request payload.
    async fn synthesize(&self, payload: &serde_json::Value) -> Result<Vec<u8>, SynthesisError>;

    /// Is the provider reachable? Default: assume yes.
    async fn health_check(&self) -> bool {
        true
    }
}
