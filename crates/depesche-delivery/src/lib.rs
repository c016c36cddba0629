//! Asynchronous message dispatch with reliability guarantees.
//!
//! This crate implements the outbound half of the delivery system: a
//! dispatch pipeline guarded by volume shaping, a circuit breaker, and
//! a bounded session pool, fed by a bounded task queue that a fixed
//! worker pool consumes.
//!
//! # Architecture
//!
//! 1. **Submit** - `Dispatcher::send_async` validates inputs and puts a
//!    task on the bounded queue, failing fast when it is saturated
//! 2. **Execute** - a worker claims the task and runs one pipeline
//!    pass: rate checks, breaker check, pooled session, transmission
//! 3. **Resolve** - success releases the session and closes the loop;
//!    transient failures evict the session and feed the per-task retry
//!    state machine with exponential backoff and jitter
//!
//! The synchronous `Dispatcher::send` runs the same pipeline inline,
//! including the backoff sleeps, for callers that want the result now.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod transport;
pub mod worker;

pub use circuit::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{DeliveryError, Result};
pub use pool::{PoolConfig, PoolSnapshot, PooledSession, SessionPool};
pub use queue::{
    DeliveryTask, JobPayload, QueueConfig, TaskId, TaskQueue, TaskSnapshot, TaskStatus,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{
    validate_recipient, LogTransport, MailSession, Message, RenderedContent, ScriptedTransport,
    SendOutcome, SentMessage, Transport, TransportConfig,
};
pub use worker::{WorkerConfig, WorkerPool};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;
