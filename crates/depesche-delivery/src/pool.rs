//! Capacity-bounded pool of outbound sessions.
//!
//! Sessions are expensive, so they are recycled between sends. The pool
//! never hands one session to two callers: a `PooledSession` owns a
//! semaphore permit, and in-use plus idle sessions can never exceed
//! capacity. Idle sessions past their TTL are probed and replaced
//! lazily on demand; there is no background sweep.

use std::{sync::Arc, time::Duration};

use depesche_core::{Clock, Metrics};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    transport::{MailSession, Transport},
};

/// Pool sizing and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum live sessions, idle and in-use combined.
    pub capacity: usize,
    /// How long `acquire` waits before failing fast.
    pub acquire_timeout: Duration,
    /// Idle age beyond which a session is probed before reuse.
    pub idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_ttl: Duration::from_secs(300),
        }
    }
}

/// Read-only pool state for status surfaces and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Configured capacity.
    pub capacity: usize,
    /// Sessions currently handed out.
    pub in_use: usize,
    /// Sessions resting in the idle set.
    pub idle: usize,
}

struct IdleSession {
    session: Box<dyn MailSession>,
    last_used: std::time::Instant,
}

/// A session on loan from the pool.
///
/// Holding one consumes a capacity permit; returning it through
/// `release` or `evict` frees the permit.
pub struct PooledSession {
    session: Box<dyn MailSession>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession").finish_non_exhaustive()
    }
}

impl PooledSession {
    /// The underlying session.
    pub fn session(&mut self) -> &mut dyn MailSession {
        &mut *self.session
    }
}

/// Bounded pool of reusable outbound sessions.
pub struct SessionPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool").field("config", &self.config).finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Creates an empty pool over the given transport.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.capacity));
        Self { transport, config, clock, semaphore, idle: Mutex::new(Vec::new()), metrics }
    }

    /// Borrows a session, waiting at most the configured timeout.
    ///
    /// Blocks only the requesting worker; there is no queueing inside
    /// the pool beyond the waiters on the capacity permit. Prefers an
    /// idle session, probing it first when it has sat past the idle
    /// TTL. A failed probe drops the session and the next candidate or
    /// a fresh connection takes its place.
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` when no permit frees up in time, or a
    /// transient error when a fresh connection cannot be established.
    pub async fn acquire(&self) -> Result<PooledSession> {
        let semaphore = self.semaphore.clone();
        let permit = tokio::select! {
            biased;
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| DeliveryError::ShutdownRequested)?
            },
            () = self.clock.sleep(self.config.acquire_timeout) => {
                self.metrics.pool.exhausted.incr();
                warn!(
                    timeout_ms = self.config.acquire_timeout.as_millis() as u64,
                    "session acquisition timed out"
                );
                return Err(DeliveryError::pool_exhausted(self.config.acquire_timeout));
            },
        };

        if let Some(session) = self.take_idle().await {
            return Ok(PooledSession { session, _permit: permit });
        }

        let session = self.transport.connect().await.map_err(|err| {
            debug!(error = %err, "failed to establish outbound session");
            err
        })?;
        self.metrics.pool.created.incr();
        Ok(PooledSession { session, _permit: permit })
    }

    async fn take_idle(&self) -> Option<Box<dyn MailSession>> {
        loop {
            let candidate = self.idle.lock().await.pop();
            let mut idle = candidate?;

            let age = self.clock.now().duration_since(idle.last_used);
            if age <= self.config.idle_ttl {
                return Some(idle.session);
            }

            // Stale session: only a passing probe earns reuse.
            match idle.session.probe().await {
                Ok(()) => return Some(idle.session),
                Err(err) => {
                    self.metrics.pool.evicted.incr();
                    debug!(error = %err, "stale session failed probe, replacing");
                },
            }
        }
    }

    /// Returns a session to the idle set after a lightweight probe.
    ///
    /// A failed probe drops the session; a replacement is created on
    /// the next demand, keeping the pool self-healing without sweeps.
    pub async fn release(&self, pooled: PooledSession) {
        let PooledSession { mut session, _permit } = pooled;
        match session.probe().await {
            Ok(()) => {
                let last_used = self.clock.now();
                self.idle.lock().await.push(IdleSession { session, last_used });
            },
            Err(err) => {
                self.metrics.pool.evicted.incr();
                debug!(error = %err, "session failed release probe, dropping");
            },
        }
        // The permit drops here, freeing capacity either way.
    }

    /// Destroys a session known to be bad.
    pub fn evict(&self, pooled: PooledSession) {
        self.metrics.pool.evicted.incr();
        drop(pooled);
    }

    /// Pre-establishes up to `count` idle sessions at startup.
    ///
    /// Best effort: stops at the first connection failure and reports
    /// how many sessions were opened.
    pub async fn warm_up(&self, count: usize) -> usize {
        let target = count.min(self.config.capacity);
        let mut opened = 0;
        for _ in 0..target {
            match self.transport.connect().await {
                Ok(session) => {
                    self.metrics.pool.created.incr();
                    let last_used = self.clock.now();
                    self.idle.lock().await.push(IdleSession { session, last_used });
                    opened += 1;
                },
                Err(err) => {
                    warn!(opened, error = %err, "pool warm-up stopped early");
                    break;
                },
            }
        }
        if opened > 0 {
            info!(opened, "session pool warmed up");
        }
        opened
    }

    /// Drops every idle session. Teardown hook.
    pub async fn close_all(&self) {
        let drained = {
            let mut idle = self.idle.lock().await;
            std::mem::take(&mut *idle)
        };
        if !drained.is_empty() {
            info!(closed = drained.len(), "closed idle sessions");
        }
    }

    /// Current pool occupancy.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let idle = self.idle.lock().await.len();
        PoolSnapshot {
            capacity: self.config.capacity,
            in_use: self.config.capacity - self.semaphore.available_permits(),
            idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use depesche_core::{BoxFuture, TestClock};

    use super::*;
    use crate::transport::RenderedContent;

    /// Transport that counts connections and can fail probes.
    #[derive(Clone, Default)]
    struct CountingTransport {
        connects: Arc<AtomicUsize>,
        fail_probes: Arc<std::sync::atomic::AtomicBool>,
    }

    struct CountingSession {
        fail_probes: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MailSession for CountingSession {
        fn send<'a>(
            &'a mut self,
            _recipient: &'a str,
            _content: &'a RenderedContent,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn probe(&mut self) -> BoxFuture<'_, Result<()>> {
            let fail = self.fail_probes.load(Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(DeliveryError::transient("probe failed"))
                } else {
                    Ok(())
                }
            })
        }
    }

    impl Transport for CountingTransport {
        fn connect(&self) -> BoxFuture<'static, Result<Box<dyn MailSession>>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let fail_probes = self.fail_probes.clone();
            Box::pin(async move {
                Ok(Box::new(CountingSession { fail_probes }) as Box<dyn MailSession>)
            })
        }
    }

    fn pool_with(capacity: usize) -> (SessionPool, CountingTransport, TestClock) {
        let clock = TestClock::new();
        let transport = CountingTransport::default();
        let config = PoolConfig {
            capacity,
            acquire_timeout: Duration::from_millis(100),
            idle_ttl: Duration::from_secs(300),
        };
        let pool = SessionPool::new(
            Arc::new(transport.clone()),
            config,
            Arc::new(clock.clone()),
            Arc::new(Metrics::new()),
        );
        (pool, transport, clock)
    }

    #[tokio::test]
    async fn in_use_sessions_never_exceed_capacity() {
        let (pool, _transport, _clock) = pool_with(2);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, DeliveryError::PoolExhausted { .. }));
        assert_eq!(pool.snapshot().await.in_use, 2);

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn released_session_is_reused() {
        let (pool, transport, _clock) = pool_with(2);

        let session = pool.acquire().await.unwrap();
        pool.release(session).await;
        let _again = pool.acquire().await.unwrap();

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_after_exhaustion_unblocks_next_acquirer() {
        let (pool, _transport, _clock) = pool_with(1);

        let first = pool.acquire().await.unwrap();
        assert!(pool.acquire().await.is_err());

        pool.release(first).await;
        let _second = pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn stale_idle_session_is_probed_before_reuse() {
        let (pool, transport, clock) = pool_with(1);

        let session = pool.acquire().await.unwrap();
        pool.release(session).await;

        // Past the idle TTL the session only survives a passing probe.
        clock.advance(Duration::from_secs(301));
        let _reused = pool.acquire().await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_release_probe_drops_the_session() {
        let (pool, transport, _clock) = pool_with(1);

        let session = pool.acquire().await.unwrap();
        transport.fail_probes.store(true, Ordering::SeqCst);

        // The release probe fails, so the session is not recycled.
        pool.release(session).await;
        assert_eq!(pool.snapshot().await.idle, 0);

        // Next acquire builds a replacement.
        transport.fail_probes.store(false, Ordering::SeqCst);
        let _fresh = pool.acquire().await.unwrap();
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn warm_up_fills_the_idle_set() {
        let (pool, transport, _clock) = pool_with(3);

        let opened = pool.warm_up(5).await;
        assert_eq!(opened, 3, "warm-up is bounded by capacity");
        assert_eq!(pool.snapshot().await.idle, 3);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 3);

        pool.close_all().await;
        assert_eq!(pool.snapshot().await.idle, 0);
    }
}
