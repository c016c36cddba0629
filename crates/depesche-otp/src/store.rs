//! Persistent state for issued one-time codes.
//!
//! Only the one-way hash of a code is ever stored. Records are keyed by
//! owner, so a new issuance supersedes any prior record for that owner
//! and at most one code is active per owner at any time.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use depesche_core::{Clock, CoreError, KeyValueStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Delivery channel a code was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Delivery to a mailbox address.
    Email,
    /// Delivery to a phone number.
    Sms,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Sms => write!(f, "sms"),
        }
    }
}

/// Stored state of one issued code.
///
/// Invariants: `attempts_used <= max_attempts` and
/// `expires_at > issued_at`. The plaintext code exists only in the
/// issuance response; it is never stored or logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRecord {
    /// Owner key the code was issued for.
    pub owner: String,
    /// Hex-encoded SHA-256 of the issued code.
    pub code_hash: String,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Failed validation attempts so far.
    pub attempts_used: u32,
    /// Attempts allowed before the record is burned.
    pub max_attempts: u32,
    /// Channel the code was sent over.
    pub channel: Channel,
    /// Address the issuance request came from, when known.
    pub issuing_ip: Option<std::net::IpAddr>,
}

/// One-way hash of a submitted or issued code.
pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn code_key(owner: &str) -> String {
    format!("otp:code:{owner}")
}

/// Code persistence over the shared key-value store.
///
/// The durable backend enforces expiry through per-key TTL; the
/// in-process fallback checks expiry lazily on read. `load` re-checks
/// the timestamp anyway, so a record past its expiry is never returned
/// regardless of backend.
#[derive(Clone)]
pub struct CodeStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeStore").finish_non_exhaustive()
    }
}

impl CodeStore {
    /// Creates a code store over the given backend.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }

    /// Stores a record, superseding any prior record for the owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or stored.
    pub async fn put(&self, record: &CodeRecord) -> Result<(), CoreError> {
        let ttl = self.remaining_ttl(record);
        let payload = serde_json::to_string(record)?;
        self.store.set_with_ttl(&code_key(&record.owner), &payload, ttl).await
    }

    /// Loads the active record for an owner.
    ///
    /// Returns `None` when no record exists or the record is past its
    /// expiry; an expired record is deleted on the way out.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn load(&self, owner: &str) -> Result<Option<CodeRecord>, CoreError> {
        let Some(payload) = self.store.get(&code_key(owner)).await? else {
            return Ok(None);
        };
        let record: CodeRecord = serde_json::from_str(&payload)?;
        if record.expires_at <= self.now() {
            self.store.delete(&code_key(owner)).await?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Persists an updated attempt count, keeping the original expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be stored.
    pub async fn save_attempts(&self, record: &CodeRecord) -> Result<(), CoreError> {
        self.put(record).await
    }

    /// Deletes the record for an owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn remove(&self, owner: &str) -> Result<(), CoreError> {
        self.store.delete(&code_key(owner)).await
    }

    fn remaining_ttl(&self, record: &CodeRecord) -> Duration {
        (record.expires_at - self.now()).to_std().unwrap_or(Duration::from_secs(1)).max(Duration::from_secs(1))
    }
}
