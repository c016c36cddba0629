//! Error types for message dispatch operations.
//!
//! Covers transmission failures, fault-tolerance rejections, and
//! resource exhaustion. Errors carry enough context for audit logging
//! and are categorized for retry decisions.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error taxonomy for the dispatch pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Temporary transmission failure (network, timeout, remote busy).
    #[error("transient delivery failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// Failure that no retry can fix (malformed recipient, rejected
    /// content).
    #[error("permanent delivery failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// A volume-shaping cap denied the send.
    #[error("rate limited by scope {scope}")]
    RateLimited {
        /// The scope that denied the request.
        scope: String,
    },

    /// The circuit breaker is open; no pooled resource was touched.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// No session became available within the acquisition timeout.
    #[error("session pool exhausted after {waited_ms}ms")]
    PoolExhausted {
        /// How long the acquisition waited.
        waited_ms: u64,
    },

    /// The task queue is saturated; explicit backpressure.
    #[error("task queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// A task exceeded its maximum lifetime and was force-failed.
    #[error("task exceeded maximum lifetime")]
    LifetimeExceeded,

    /// Invalid configuration or input detected before any send.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// The engine is shutting down.
    #[error("shutdown requested")]
    ShutdownRequested,
}

impl DeliveryError {
    /// Creates a transient error from a message.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient { message: message.into() }
    }

    /// Creates a permanent error from a message.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent { message: message.into() }
    }

    /// Creates a rate-limited error for a scope.
    pub fn rate_limited(scope: impl Into<String>) -> Self {
        Self::RateLimited { scope: scope.into() }
    }

    /// Creates a pool-exhaustion error.
    pub fn pool_exhausted(waited: Duration) -> Self {
        Self::PoolExhausted { waited_ms: waited.as_millis().try_into().unwrap_or(u64::MAX) }
    }

    /// Creates a queue-full error.
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Creates a configuration error from a message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether a later attempt could plausibly succeed.
    ///
    /// Rate limits, open breakers, and exhausted pools clear with time,
    /// so the task state machine may reschedule them. Permanent and
    /// configuration failures never come back.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. }
            | Self::RateLimited { .. }
            | Self::CircuitOpen
            | Self::PoolExhausted { .. } => true,

            Self::Permanent { .. }
            | Self::QueueFull { .. }
            | Self::LifetimeExceeded
            | Self::Configuration { .. }
            | Self::ShutdownRequested => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::transient("connection reset").is_retryable());
        assert!(DeliveryError::rate_limited("dispatch-global").is_retryable());
        assert!(DeliveryError::CircuitOpen.is_retryable());
        assert!(DeliveryError::pool_exhausted(Duration::from_secs(5)).is_retryable());

        assert!(!DeliveryError::permanent("malformed recipient").is_retryable());
        assert!(!DeliveryError::queue_full(128).is_retryable());
        assert!(!DeliveryError::LifetimeExceeded.is_retryable());
        assert!(!DeliveryError::configuration("bad transport host").is_retryable());
        assert!(!DeliveryError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn error_display_format() {
        let err = DeliveryError::pool_exhausted(Duration::from_millis(2500));
        assert_eq!(err.to_string(), "session pool exhausted after 2500ms");

        let err = DeliveryError::queue_full(64);
        assert_eq!(err.to_string(), "task queue full (capacity 64)");
    }
}
