//! The message dispatch pipeline.
//!
//! Every send runs the same gauntlet: volume shaping, circuit breaker,
//! pooled session, transmission. The synchronous entry point retries
//! transient failures inline with backoff; the asynchronous entry point
//! does none of this and only validates inputs before handing the job
//! to the task queue, so callers never block on network I/O.

use std::{collections::HashMap, sync::Arc};

use depesche_core::{Clock, KeyValueStore, Metrics, RateLimit, RateLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    circuit::{BreakerConfig, CircuitBreaker},
    error::{DeliveryError, Result},
    pool::{PoolConfig, SessionPool},
    queue::{JobPayload, TaskId, TaskQueue, TaskSnapshot},
    retry::{RetryDecision, RetryPolicy},
    transport::{validate_recipient, Message, RenderedContent, Transport},
};

/// Rendered content entries kept before the cache resets.
const RENDER_CACHE_LIMIT: usize = 256;

/// Dispatcher pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Volume cap across all recipients.
    pub global_limit: RateLimit,
    /// Volume cap per recipient.
    pub recipient_limit: RateLimit,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Session pool sizing.
    pub pool: PoolConfig,
    /// Backoff policy shared by the inline and task-level retry paths.
    pub retry: RetryPolicy,
    /// Retry budget for tasks submitted through the async entry points.
    pub default_max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            // Volume shaping tolerates a briefly unreachable store;
            // these caps protect throughput, not a secret.
            global_limit: RateLimit::fail_open(600, std::time::Duration::from_secs(60)),
            recipient_limit: RateLimit::fail_open(10, std::time::Duration::from_secs(60)),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            default_max_retries: 3,
        }
    }
}

/// Sends messages over the pooled outbound channel.
pub struct Dispatcher {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    pool: SessionPool,
    queue: TaskQueue,
    render_cache: Mutex<HashMap<String, Arc<RenderedContent>>>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Builds the pipeline over the given store, transport, and queue.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        queue: TaskQueue,
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = RateLimiter::new(store, clock.clone());
        let breaker = CircuitBreaker::new(config.breaker.clone(), clock.clone());
        let pool =
            SessionPool::new(transport, config.pool.clone(), clock.clone(), metrics.clone());
        Self {
            limiter,
            breaker,
            pool,
            queue,
            render_cache: Mutex::new(HashMap::new()),
            config,
            clock,
            metrics,
        }
    }

    /// Sends one message, retrying transient failures inline.
    ///
    /// Blocks the caller through the full pipeline including backoff
    /// sleeps. Rate-limit, breaker, and pool rejections are returned
    /// as-is; only transient transmission failures are retried here.
    ///
    /// # Errors
    ///
    /// Returns the final pipeline error once the retry budget is spent
    /// or a non-transient rejection occurs.
    pub async fn send(&self, message: Message) -> Result<()> {
        validate_recipient(&message.recipient)?;

        let mut attempt = 1u32;
        loop {
            match self.try_send_once(&message).await {
                Ok(()) => return Ok(()),
                Err(err @ DeliveryError::Transient { .. }) => {
                    match self.config.retry.decide(attempt, &err) {
                        RetryDecision::Retry { delay } => {
                            self.metrics.dispatch.retries.incr();
                            warn!(
                                recipient = %message.recipient,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "transient send failure, backing off"
                            );
                            self.clock.sleep(delay).await;
                            attempt += 1;
                        },
                        RetryDecision::GiveUp { reason } => {
                            warn!(recipient = %message.recipient, reason, "giving up on send");
                            return Err(err);
                        },
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Enqueues a notification for asynchronous delivery.
    ///
    /// Validates inputs and submits; never touches the network.
    ///
    /// # Errors
    ///
    /// Returns a permanent error for a malformed recipient, or the
    /// queue's backpressure error when it is saturated.
    pub async fn send_async(&self, message: Message) -> Result<TaskId> {
        validate_recipient(&message.recipient)?;
        self.queue
            .submit(JobPayload::Notification { message }, self.config.default_max_retries)
            .await
    }

    /// Enqueues a one-time-code delivery on behalf of an owner.
    ///
    /// # Errors
    ///
    /// Same contract as `send_async`.
    pub async fn send_code_async(&self, owner: &str, message: Message) -> Result<TaskId> {
        validate_recipient(&message.recipient)?;
        self.queue
            .submit(
                JobPayload::CodeDelivery { owner: owner.to_string(), message },
                self.config.default_max_retries,
            )
            .await
    }

    /// Status of an asynchronously submitted task.
    pub async fn task_status(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.queue.task_status(id).await
    }

    /// Executes one queued job: a single pass through the pipeline.
    ///
    /// Retry scheduling for queued jobs belongs to the task state
    /// machine, not to this call.
    pub(crate) async fn execute(&self, payload: &JobPayload) -> Result<()> {
        self.try_send_once(payload.message()).await
    }

    /// One pipeline pass: rate checks, breaker, session, transmission.
    pub(crate) async fn try_send_once(&self, message: &Message) -> Result<()> {
        let content = self.rendered(message).await;

        let global = self
            .limiter
            .check_and_consume("dispatch-global", "volume", &self.config.global_limit)
            .await;
        if !global.allowed {
            self.metrics.dispatch.rate_limited.incr();
            return Err(DeliveryError::rate_limited("dispatch-global"));
        }
        let per_recipient = self
            .limiter
            .check_and_consume(
                "dispatch-recipient",
                &message.recipient,
                &self.config.recipient_limit,
            )
            .await;
        if !per_recipient.allowed {
            self.metrics.dispatch.rate_limited.incr();
            return Err(DeliveryError::rate_limited("dispatch-recipient"));
        }

        if let Err(err) = self.breaker.try_acquire().await {
            self.metrics.dispatch.breaker_rejections.incr();
            return Err(err);
        }

        let mut session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(err @ DeliveryError::Transient { .. }) => {
                // Failing to even connect is a downstream failure.
                self.breaker.record_failure().await;
                self.metrics.dispatch.transient_failures.incr();
                return Err(err);
            },
            Err(err) => {
                // Pool exhaustion says nothing about the downstream, so
                // a half-open probe slot must not stay claimed.
                self.breaker.abandon_probe().await;
                return Err(err);
            },
        };

        let send_result = session.session().send(&message.recipient, content.as_ref()).await;
        match send_result {
            Ok(()) => {
                self.pool.release(session).await;
                self.breaker.record_success().await;
                self.metrics.dispatch.sent.incr();
                debug!(recipient = %message.recipient, "message transmitted");
                Ok(())
            },
            Err(err @ DeliveryError::Transient { .. }) => {
                self.pool.evict(session);
                self.breaker.record_failure().await;
                self.metrics.dispatch.transient_failures.incr();
                warn!(recipient = %message.recipient, error = %err, "transient transmission failure");
                Err(err)
            },
            Err(err) => {
                // The gateway answered and refused this message. The
                // session is healthy and the refusal says nothing about
                // an outage.
                self.pool.release(session).await;
                self.breaker.abandon_probe().await;
                self.metrics.dispatch.permanent_failures.incr();
                warn!(recipient = %message.recipient, error = %err, "permanent transmission failure");
                Err(err)
            },
        }
    }

    async fn rendered(&self, message: &Message) -> Arc<RenderedContent> {
        let hash = message.content_hash();
        let mut cache = self.render_cache.lock().await;
        if let Some(content) = cache.get(&hash) {
            return content.clone();
        }
        if cache.len() >= RENDER_CACHE_LIMIT {
            debug!(entries = cache.len(), "render cache reset");
            cache.clear();
        }
        let content = Arc::new(RenderedContent::render(message));
        cache.insert(hash, content.clone());
        content
    }

    /// The retry policy shared with the task state machine.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// The queue this dispatcher submits async work to.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// The breaker guarding the outbound channel.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The session pool.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use depesche_core::{MemoryStore, TestClock};

    use super::*;
    use crate::{
        circuit::BreakerState,
        queue::{QueueConfig, TaskStatus},
        transport::ScriptedTransport,
    };

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            global_limit: RateLimit::fail_open(100, Duration::from_secs(60)),
            recipient_limit: RateLimit::fail_open(50, Duration::from_secs(60)),
            breaker: BreakerConfig { failure_threshold: 3, cooldown: Duration::from_secs(30) },
            pool: PoolConfig {
                capacity: 2,
                acquire_timeout: Duration::from_millis(100),
                idle_ttl: Duration::from_secs(300),
            },
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                jitter_factor: 0.0,
            },
            default_max_retries: 2,
        }
    }

    fn dispatcher_with(config: DispatcherConfig) -> (Dispatcher, ScriptedTransport, TestClock) {
        let clock = TestClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let metrics = Arc::new(Metrics::new());
        let transport = ScriptedTransport::new();
        let (queue, rx) =
            TaskQueue::new(QueueConfig::default(), Arc::new(clock.clone()), metrics.clone());
        // Keep the receiver alive for the lifetime of the test process so the
        // submission channel stays open; no worker drains it in these tests.
        std::mem::forget(rx);
        let dispatcher = Dispatcher::new(
            store,
            Arc::new(transport.clone()),
            queue,
            config,
            Arc::new(clock.clone()),
            metrics,
        );
        (dispatcher, transport, clock)
    }

    fn message() -> Message {
        Message::new("user@example.com", "Subject", "Body")
    }

    #[tokio::test]
    async fn successful_send_transmits_and_recycles_the_session() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());

        dispatcher.send(message()).await.unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].recipient, "user@example.com");
        // The session went back to the idle set.
        assert_eq!(dispatcher.pool().snapshot().await.idle, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_inline() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());
        transport.script_failures(1, DeliveryError::transient("connection reset"));

        dispatcher.send(message()).await.unwrap();

        assert_eq!(transport.sent().len(), 1);
        // The failed session was evicted, the retry built a new one.
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_the_inline_budget() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());
        transport.script_failures(3, DeliveryError::transient("connection reset"));

        let err = dispatcher.send(message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transient { .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_never_retried() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());
        transport.script(crate::transport::SendOutcome::Fail(DeliveryError::permanent(
            "mailbox does not exist",
        )));

        let err = dispatcher.send(message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { .. }));
        // Exactly one session, exactly one attempt.
        assert_eq!(transport.connect_count(), 1);
        // A refusal is not an outage; the breaker stays closed.
        assert_eq!(dispatcher.breaker().snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn malformed_recipient_fails_before_any_resource() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());

        let err = dispatcher.send(Message::new("not-an-address", "S", "B")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { .. }));
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_before_the_pool() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());
        // Three consecutive transient failures open the breaker; the
        // inline budget of each send is 3 attempts, so one send does it.
        transport.script_failures(3, DeliveryError::transient("connection reset"));
        let _ = dispatcher.send(message()).await;
        assert_eq!(dispatcher.breaker().snapshot().await.state, BreakerState::Open);

        let connects_before = transport.connect_count();
        let err = dispatcher.send(message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::CircuitOpen));
        assert_eq!(transport.connect_count(), connects_before, "no session may be acquired");
    }

    #[tokio::test]
    async fn cooldown_admits_a_single_probe_that_closes_on_success() {
        let (dispatcher, transport, clock) = dispatcher_with(test_config());
        transport.script_failures(3, DeliveryError::transient("connection reset"));
        let _ = dispatcher.send(message()).await;
        assert_eq!(dispatcher.breaker().snapshot().await.state, BreakerState::Open);

        clock.advance(Duration::from_secs(31));
        dispatcher.send(message()).await.unwrap();
        assert_eq!(dispatcher.breaker().snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn recipient_volume_cap_rejects_excess_sends() {
        let mut config = test_config();
        config.recipient_limit = RateLimit::fail_open(1, Duration::from_secs(60));
        let (dispatcher, transport, _clock) = dispatcher_with(config);

        dispatcher.send(message()).await.unwrap();
        let err = dispatcher.send(message()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::RateLimited { ref scope } if scope == "dispatch-recipient"));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn send_async_only_validates_and_enqueues() {
        let (dispatcher, transport, _clock) = dispatcher_with(test_config());

        let id = dispatcher.send_async(message()).await.unwrap();

        let status = dispatcher.task_status(id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Queued);
        assert_eq!(status.attempt_count, 0);
        // No network activity on the submission path.
        assert_eq!(transport.connect_count(), 0);

        let err = dispatcher.send_async(Message::new("bad", "S", "B")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { .. }));
    }

    #[tokio::test]
    async fn rendered_content_is_cached_by_hash() {
        let (dispatcher, _transport, _clock) = dispatcher_with(test_config());

        let a = dispatcher.rendered(&message()).await;
        let b = dispatcher.rendered(&message()).await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = dispatcher.rendered(&Message::new("user@example.com", "Other", "Body")).await;
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
