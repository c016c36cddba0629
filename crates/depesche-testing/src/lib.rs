//! Test infrastructure for deterministic end-to-end testing.
//!
//! Provides a composed environment with a virtual clock, an in-memory
//! store, a scriptable transport, and running workers, plus store
//! doubles for failure injection and fixture helpers. Everything here
//! exists so the integration suites can drive the whole stack without
//! real time, a real store, or a real wire.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod fixtures;
pub mod stores;

pub use env::{TestEnv, TestEnvBuilder};
pub use fixtures::{address_for, extract_code, notification, InMemoryCredentials};
pub use stores::{FailingStore, SwitchableStore};
