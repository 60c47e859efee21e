//! Error taxonomy for the store boundary (C1) and the typed failures that
//! cross it. Everything above this boundary uses `anyhow::Result` with
//! `.context(...)`, matching the error model the rest of the crate follows.

use thiserror::Error;

/// The store's failure categories. Callers (C3, C8) match on these to
/// decide retry vs. ack-and-record; nothing here is allowed to silently
/// degrade to "continue as if nothing happened".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("permanent store error: {0}")]
    Permanent(String),

    #[error("key not found")]
    NotFound,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, StoreError::Permanent(_))
    }
}

/// Raised when a real redis client error needs classifying into the
/// taxonomy above. IO/timeout errors are transient; everything else
/// (auth, protocol, scripting) is permanent.
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_io_error() || err.is_connection_dropped() {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Permanent(err.to_string())
        }
    }
}

/// A per-participant outcome. Failures inside a participant must never
/// propagate out of the Coordinator as a fatal error: `Coordinator::dispatch`
/// always produces one of these per participant, even on panic/error.
#[derive(Debug, Clone)]
pub struct ParticipantOutcome {
    pub participant: String,
    pub success: bool,
    pub detail: String,
}

impl ParticipantOutcome {
    pub fn ok(participant: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(participant: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            participant: participant.into(),
            success: false,
            detail: detail.into(),
        }
    }
}
