//! Fixed-window rate limiting backed by the shared key-value store.
//!
//! Counters live under composite keys of scope, identifier, and window
//! bucket. Stale buckets are never swept; a new bucket simply starts at
//! zero and old keys age out through their TTL.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    kv::KeyValueStore,
    time::{unix_seconds, Clock},
};

/// Outcome when the backing store cannot answer a rate check.
///
/// Checks protecting a security-sensitive resource should fail closed;
/// coarse volume shaping may fail open. The asymmetry is configured per
/// limit, never assumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Allow the request when the store is unreachable.
    FailOpen,
    /// Reject the request when the store is unreachable.
    FailClosed,
}

/// One fixed-window cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum allowed checks per window.
    pub limit: u32,
    /// Window length.
    pub window: Duration,
    /// Behavior when the store cannot be consulted.
    pub on_store_error: FailurePolicy,
}

impl RateLimit {
    /// Convenience constructor for a fail-closed cap.
    pub fn fail_closed(limit: u32, window: Duration) -> Self {
        Self { limit, window, on_store_error: FailurePolicy::FailClosed }
    }

    /// Convenience constructor for a fail-open cap.
    pub fn fail_open(limit: u32, window: Duration) -> Self {
        Self { limit, window, on_store_error: FailurePolicy::FailOpen }
    }
}

/// Result of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Checks remaining in the current window.
    pub remaining: u32,
}

/// Fixed-window limiter over any `KeyValueStore`.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a limiter over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Atomically counts this request against the window and decides.
    ///
    /// The increment is a single read-modify-write at the storage layer.
    /// Over-limit requests still advance the counter, so a rejected
    /// check never refunds quota and callers must not double-count.
    /// Requests near a window boundary can receive a fresh allowance
    /// slightly early; that bounded imprecision is inherent to fixed
    /// windows.
    pub async fn check_and_consume(
        &self,
        scope: &str,
        identifier: &str,
        limit: &RateLimit,
    ) -> RateDecision {
        let window_secs = limit.window.as_secs().max(1);
        let bucket = unix_seconds(self.clock.as_ref()) / window_secs;
        let key = bucket_key(scope, identifier, bucket);

        // TTL outlives the window so a live bucket is never cut short.
        match self.store.increment(&key, limit.window * 2).await {
            Ok(count) => {
                let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
                RateDecision {
                    allowed: count <= limit.limit,
                    remaining: limit.limit.saturating_sub(count),
                }
            },
            Err(err) => {
                warn!(scope, error = %err, "rate check could not reach the store");
                match limit.on_store_error {
                    FailurePolicy::FailOpen => {
                        RateDecision { allowed: true, remaining: limit.limit }
                    },
                    FailurePolicy::FailClosed => RateDecision { allowed: false, remaining: 0 },
                }
            },
        }
    }
}

fn bucket_key(scope: &str, identifier: &str, bucket: u64) -> String {
    format!("rate:{scope}:{identifier}:{bucket}")
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use proptest::prelude::*;

    use super::*;
    use crate::{kv::MemoryStore, time::TestClock};

    fn limiter_with_clock() -> (RateLimiter, TestClock) {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        (RateLimiter::new(store, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn exactly_limit_checks_pass_within_one_window() {
        let (limiter, _clock) = limiter_with_clock();
        let cap = RateLimit::fail_closed(3, Duration::from_secs(3600));

        for expected_remaining in (0..3).rev() {
            let decision = limiter.check_and_consume("issue", "u1", &cap).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = limiter.check_and_consume("issue", "u1", &cap).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[tokio::test]
    async fn new_window_grants_fresh_allowance() {
        let (limiter, clock) = limiter_with_clock();
        let cap = RateLimit::fail_closed(1, Duration::from_secs(60));

        assert!(limiter.check_and_consume("issue", "u1", &cap).await.allowed);
        assert!(!limiter.check_and_consume("issue", "u1", &cap).await.allowed);

        clock.advance(Duration::from_secs(61));
        assert!(limiter.check_and_consume("issue", "u1", &cap).await.allowed);
    }

    #[tokio::test]
    async fn identifiers_are_counted_independently() {
        let (limiter, _clock) = limiter_with_clock();
        let cap = RateLimit::fail_closed(1, Duration::from_secs(60));

        assert!(limiter.check_and_consume("issue", "u1", &cap).await.allowed);
        assert!(limiter.check_and_consume("issue", "u2", &cap).await.allowed);
        assert!(!limiter.check_and_consume("issue", "u1", &cap).await.allowed);
    }

    #[tokio::test]
    async fn store_failure_honors_policy() {
        use crate::error::{CoreError, Result};
        use crate::kv::BoxFuture;

        /// Store that always errors.
        #[derive(Debug, Clone)]
        struct DownStore;

        impl KeyValueStore for DownStore {
            fn get(&self, _key: &str) -> BoxFuture<'static, Result<Option<String>>> {
                Box::pin(async { Err(CoreError::unavailable("down")) })
            }
            fn set_with_ttl(
                &self,
                _key: &str,
                _value: &str,
                _ttl: Duration,
            ) -> BoxFuture<'static, Result<()>> {
                Box::pin(async { Err(CoreError::unavailable("down")) })
            }
            fn increment(&self, _key: &str, _ttl: Duration) -> BoxFuture<'static, Result<i64>> {
                Box::pin(async { Err(CoreError::unavailable("down")) })
            }
            fn delete(&self, _key: &str) -> BoxFuture<'static, Result<()>> {
                Box::pin(async { Err(CoreError::unavailable("down")) })
            }
            fn ping(&self) -> BoxFuture<'static, Result<()>> {
                Box::pin(async { Err(CoreError::unavailable("down")) })
            }
        }

        let clock = TestClock::new();
        let limiter = RateLimiter::new(Arc::new(DownStore), Arc::new(clock));

        let closed = RateLimit::fail_closed(5, Duration::from_secs(60));
        assert!(!limiter.check_and_consume("issue", "u1", &closed).await.allowed);

        let open = RateLimit::fail_open(5, Duration::from_secs(60));
        assert!(limiter.check_and_consume("volume", "all", &open).await.allowed);
    }

    proptest! {
        #[test]
        fn bucket_index_is_stable_inside_a_window(
            window in 1u64..86_400,
            start in 0u64..4_000_000_000,
            offset in 0u64..86_400,
        ) {
            let bucket_at = |t: u64| t / window;
            let inside = offset % window;
            // Two checks inside the same window always share a bucket.
            let aligned = start - (start % window);
            prop_assert_eq!(bucket_at(aligned), bucket_at(aligned + inside));
            // The next window is always a different bucket.
            prop_assert_ne!(bucket_at(aligned), bucket_at(aligned + window));
        }
    }
}
