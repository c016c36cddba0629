//! Clock abstraction for testable timing operations.
//!
//! Production code uses `RealClock`; tests inject `TestClock` to drive
//! window buckets, breaker cooldowns, and retry delays deterministically.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// Time source injected into every time-sensitive component.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    ///
    /// Maps to `tokio::time::sleep` in production; test clocks advance
    /// virtual time and return immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Seconds since the Unix epoch according to the given clock.
pub fn unix_seconds(clock: &dyn Clock) -> u64 {
    clock.now_system().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Production clock backed by system time and tokio sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Controllable clock for deterministic tests.
///
/// Monotonic and system time advance together through `advance`. The
/// `sleep` implementation advances the clock by the requested duration
/// and yields once, so retry and cooldown paths run without real waits.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_system: SystemTime,
}

impl TestClock {
    /// Creates a test clock anchored at the current time.
    pub fn new() -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_system: SystemTime::now(),
        }
    }

    /// Creates a test clock anchored at a specific system time.
    pub fn with_start_time(start: SystemTime) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_system: start,
        }
    }

    /// Advances both monotonic and system time.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos().min(u128::from(u64::MAX))).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.offset()
    }

    fn now_system(&self) -> SystemTime {
        self.base_system + self.offset()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::new();
        let start_instant = clock.now();
        let start_system = clock.now_system();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(start_instant), Duration::from_secs(90));
        assert_eq!(
            clock.now_system().duration_since(start_system).unwrap(),
            Duration::from_secs(90)
        );
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_secs(30)).await;

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(30));
    }

    #[test]
    fn unix_seconds_follows_start_time() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(unix_seconds(&clock), 1_000_000);

        clock.advance(Duration::from_secs(25));
        assert_eq!(unix_seconds(&clock), 1_000_025);
    }
}
