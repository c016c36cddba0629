//! Foundational types for the depesche delivery system.
//!
//! Provides the shared key-value store contract with its durable and
//! in-process backends, fixed-window rate limiting, clock abstraction,
//! process metrics, and the core error taxonomy. All other crates build
//! on these primitives.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod kv;
pub mod metrics;
pub mod rate;
pub mod time;

pub use error::{CoreError, Result};
pub use kv::{BoxFuture, FallbackStore, KeyValueStore, MemoryStore, RedisStore};
pub use metrics::Metrics;
pub use rate::{FailurePolicy, RateDecision, RateLimit, RateLimiter};
pub use time::{Clock, RealClock, TestClock};
