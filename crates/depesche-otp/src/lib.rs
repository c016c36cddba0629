//! One-time-code issuance and validation.
//!
//! Codes are issued under per-owner rate caps, stored only as one-way
//! hashes, and consumed on first successful validation. The store
//! layer rides on the shared key-value contract from `depesche-core`,
//! so durable and in-process backends behave identically here.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod manager;
pub mod store;

pub use manager::{CodeStatus, OtpConfig, OtpError, OtpManager};
pub use store::{hash_code, Channel, CodeRecord, CodeStore};
