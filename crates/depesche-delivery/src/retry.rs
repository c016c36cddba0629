//! Exponential backoff with jitter for failed deliveries.
//!
//! One policy serves both retry paths: the inline loop of the
//! synchronous send and the task state machine driven by the workers.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy for delivery attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the initial one.
    pub max_attempts: u32,

    /// Base delay for the exponential backoff calculation.
    pub base_delay: Duration,

    /// Ceiling for any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
        }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay.
    Retry {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Stop; the failure is final.
    GiveUp {
        /// Why no further attempt will be made.
        reason: String,
    },
}

impl RetryPolicy {
    /// Backoff delay for the given 1-based attempt number.
    ///
    /// Doubles per attempt from `base_delay`, capped at `max_delay`,
    /// then randomized by the jitter fraction so synchronized failures
    /// do not retry in lockstep.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        let raw = self.base_delay.saturating_mul(multiplier);
        let capped = raw.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }

    /// Decides whether a failed attempt should be repeated.
    pub fn decide(&self, attempt: u32, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exhausted", self.max_attempts),
            };
        }
        RetryDecision::Retry { delay: self.backoff_delay(attempt) }
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    if range <= 0.0 {
        return duration;
    }
    let offset = rand::rng().random_range(-range..=range);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() }
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = no_jitter();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(30), ..no_jitter() };
        assert_eq!(policy.backoff_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..no_jitter() };
        let err = DeliveryError::transient("timeout");

        assert!(matches!(policy.decide(1, &err), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(2, &err), RetryDecision::Retry { .. }));
        match policy.decide(3, &err) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn permanent_errors_never_retry() {
        let policy = no_jitter();
        match policy.decide(1, &DeliveryError::permanent("bad recipient")) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("permanent errors must not retry"),
        }
    }

    #[test]
    fn jitter_varies_delay_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_secs(15), "too large: {jittered:?}");
            seen.insert(jittered.as_millis());
        }
        assert!(seen.len() > 1, "jitter should create variation");
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_max_delay(
            attempt in 1u32..64,
            base_ms in 1u64..10_000,
            max_ms in 1u64..600_000,
            jitter in 0.0f64..1.0,
        ) {
            let policy = RetryPolicy {
                max_attempts: u32::MAX,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                jitter_factor: jitter,
            };
            prop_assert!(policy.backoff_delay(attempt) <= policy.max_delay);
        }
    }
}
