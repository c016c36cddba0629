//! Process-wide counters for delivery and issuance observability.
//!
//! Counters are monotonic, initialized at startup, and reset only on
//! process restart. Components share one `Arc<Metrics>` and increment
//! without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments the counter by one.
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for code issuance and validation.
#[derive(Debug, Default)]
pub struct OtpCounters {
    /// Codes issued.
    pub issued: Counter,
    /// Successful validations.
    pub validated: Counter,
    /// Failed validations (any internal reason).
    pub validation_failed: Counter,
    /// Issuance requests denied by rate caps.
    pub rate_limited: Counter,
}

/// Counters for the dispatch pipeline.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    /// Messages transmitted successfully.
    pub sent: Counter,
    /// Transient transmission failures.
    pub transient_failures: Counter,
    /// Permanent transmission failures.
    pub permanent_failures: Counter,
    /// Sends denied by volume shaping.
    pub rate_limited: Counter,
    /// Sends rejected while the breaker was open.
    pub breaker_rejections: Counter,
    /// Inline retry attempts.
    pub retries: Counter,
}

/// Counters for the session pool.
#[derive(Debug, Default)]
pub struct PoolCounters {
    /// Sessions established.
    pub created: Counter,
    /// Sessions dropped after a failed probe or transmission.
    pub evicted: Counter,
    /// Acquisitions that timed out.
    pub exhausted: Counter,
}

/// Counters for the task queue and workers.
#[derive(Debug, Default)]
pub struct QueueCounters {
    /// Tasks accepted onto the queue.
    pub submitted: Counter,
    /// Submissions rejected because the queue was full.
    pub rejected: Counter,
    /// Task executions scheduled for retry.
    pub retried: Counter,
    /// Tasks that reached the failed state.
    pub failed: Counter,
    /// Tasks that reached the succeeded state.
    pub succeeded: Counter,
    /// Tasks force-failed after exceeding their lifetime.
    pub expired: Counter,
}

/// Counters for the key-value store layer.
#[derive(Debug, Default)]
pub struct StoreCounters {
    /// Transitions from the durable backend to the in-process fallback.
    pub fallback_entered: Counter,
    /// Recoveries back to the durable backend.
    pub fallback_recovered: Counter,
    /// Store operations that returned an error.
    pub errors: Counter,
}

/// All per-component counters for one process.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Issuance and validation counters.
    pub otp: OtpCounters,
    /// Dispatch pipeline counters.
    pub dispatch: DispatchCounters,
    /// Session pool counters.
    pub pool: PoolCounters,
    /// Task queue counters.
    pub queue: QueueCounters,
    /// Key-value store counters.
    pub store: StoreCounters,
}

impl Metrics {
    /// Creates a zeroed metrics registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = Metrics::new();
        assert_eq!(metrics.dispatch.sent.get(), 0);

        metrics.dispatch.sent.incr();
        metrics.dispatch.sent.incr();
        assert_eq!(metrics.dispatch.sent.get(), 2);
    }
}
