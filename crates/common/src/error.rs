use thiserror::Error;

/// Top-level error type for coordination operations.
#[derive(Debug, Error)]
pub enum SentinelError {
    // --- Caller-decides errors ---
    #[error("Not found: {0}")]
    NotFound(String),

    /// Atomic assignment rejected or a concurrent writer raced.
    /// Recoverable under retry/steal-stale acquire strategies.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Release attempted against a lock owned by a different worker.
    /// Fatal for the caller, never retried.
    #[error("Not owner: {0}")]
    NotOwner(String),

    // --- Recoverable errors (retried inside components) ---
    #[error("Transport error: {0}")]
    Transport(String),

    /// The ticket store signalled throttling. Retried after a long fixed
    /// backoff, counted against the retry budget.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    // --- Fatal errors, never retried ---
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cancellation observed during a suspending operation.
    #[error("Shutdown in progress")]
    Shutdown,

    // --- Operational errors ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl SentinelError {
    /// Whether a component-internal retry loop may retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }

    /// Whether the ticket store signalled throttling (long fixed backoff).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SentinelError::Transport("socket closed".into()).is_retryable());
        assert!(SentinelError::RateLimited("429".into()).is_retryable());
        assert!(!SentinelError::NotOwner("w2 holds it".into()).is_retryable());
        assert!(!SentinelError::InvalidInput("bad key".into()).is_retryable());
        assert!(!SentinelError::Shutdown.is_retryable());
    }
}
