//! Circuit breaker protecting the outbound channel.
//!
//! One breaker guards one dispatcher. While open, every call is
//! rejected before any pooled resource is touched, which is what keeps
//! a failing downstream from exhausting the session pool or piling up
//! retries.
//!
//! State machine: Closed moves to Open once consecutive failures reach
//! the threshold. After the cooldown, Open admits exactly one half-open
//! probe; the probe's outcome either closes the breaker or restarts the
//! cooldown.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use depesche_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{DeliveryError, Result};

/// Breaker thresholds and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time to wait in Open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

/// Current breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Normal operation, calls allowed.
    Closed,
    /// Failing fast, calls rejected.
    Open,
    /// Testing recovery with a single probe.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Read-only view of breaker internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures observed.
    pub consecutive_failures: u32,
    /// Whether a half-open probe is currently in flight.
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker with a single half-open probe.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Admits or rejects a call.
    ///
    /// In Open, flips to HalfOpen once the cooldown has elapsed. In
    /// HalfOpen, the first caller becomes the probe and concurrent
    /// callers are rejected until the probe resolves.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CircuitOpen` when the call must not
    /// proceed.
    pub async fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state == BreakerState::Open {
            let cooled = inner
                .opened_at
                .is_some_and(|at| self.clock.now().duration_since(at) >= self.config.cooldown);
            if cooled {
                info!("circuit breaker cooldown elapsed, admitting a probe");
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = false;
            }
        }

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(DeliveryError::CircuitOpen),
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(DeliveryError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            },
        }
    }

    /// Records a successful call.
    ///
    /// A successful half-open probe closes the breaker and resets its
    /// counters.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            info!("probe succeeded, circuit breaker closing");
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.probe_in_flight = false;
        }
    }

    /// Records a failed call.
    ///
    /// Reaching the failure threshold opens the breaker; a failed
    /// half-open probe reopens it and restarts the cooldown.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "failure threshold reached, circuit breaker opening"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(self.clock.now());
                }
            },
            BreakerState::HalfOpen => {
                warn!("probe failed, circuit breaker reopening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(self.clock.now());
                inner.probe_in_flight = false;
            },
            BreakerState::Open => {},
        }
    }

    /// Releases an admitted call without a health verdict.
    ///
    /// For paths where the call never reached the downstream (pool
    /// exhaustion, permanent input failures): the probe slot must not
    /// stay claimed, but neither outcome says anything about recovery.
    pub async fn abandon_probe(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    /// Current internals for status surfaces and tests.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            probe_in_flight: inner.probe_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use depesche_core::TestClock;

    use super::*;

    fn breaker() -> (CircuitBreaker, TestClock) {
        let clock = TestClock::new();
        let config = BreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(30) };
        (CircuitBreaker::new(config, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn starts_closed_and_admits_calls() {
        let (cb, _clock) = breaker();
        cb.try_acquire().await.unwrap();
        assert_eq!(cb.snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let (cb, _clock) = breaker();

        for _ in 0..2 {
            cb.record_failure().await;
            cb.try_acquire().await.unwrap();
        }
        cb.record_failure().await;

        let err = cb.try_acquire().await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen));
        assert_eq!(cb.snapshot().await.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let (cb, _clock) = breaker();

        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        cb.record_failure().await;

        // Streak was broken, so the breaker is still closed.
        cb.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn cooldown_admits_exactly_one_probe() {
        let (cb, clock) = breaker();

        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert!(cb.try_acquire().await.is_err());

        clock.advance(Duration::from_secs(31));

        // First caller becomes the probe; concurrent callers bounce.
        cb.try_acquire().await.unwrap();
        assert!(cb.try_acquire().await.is_err());
        assert!(cb.snapshot().await.probe_in_flight);
    }

    #[tokio::test]
    async fn successful_probe_closes_the_breaker() {
        let (cb, clock) = breaker();

        for _ in 0..3 {
            cb.record_failure().await;
        }
        clock.advance(Duration::from_secs(31));
        cb.try_acquire().await.unwrap();
        cb.record_success().await;

        let snapshot = cb.snapshot().await;
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        cb.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn failed_probe_restarts_the_cooldown() {
        let (cb, clock) = breaker();

        for _ in 0..3 {
            cb.record_failure().await;
        }
        clock.advance(Duration::from_secs(31));
        cb.try_acquire().await.unwrap();
        cb.record_failure().await;

        assert_eq!(cb.snapshot().await.state, BreakerState::Open);
        assert!(cb.try_acquire().await.is_err());

        // A fresh cooldown admits the next probe.
        clock.advance(Duration::from_secs(31));
        cb.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_probe_frees_the_slot() {
        let (cb, clock) = breaker();

        for _ in 0..3 {
            cb.record_failure().await;
        }
        clock.advance(Duration::from_secs(31));

        cb.try_acquire().await.unwrap();
        cb.abandon_probe().await;

        // The slot is free again without any state transition.
        assert_eq!(cb.snapshot().await.state, BreakerState::HalfOpen);
        cb.try_acquire().await.unwrap();
    }
}
