//! Issuance and validation of one-time codes.
//!
//! Issuance is gated by per-owner rate caps and stores only the code
//! hash. Validation is single-use: a correct submission burns the
//! record, a wrong one spends an attempt, and an exhausted record is
//! deleted so later submissions cannot succeed even with the right
//! code. Specific failure reasons stay internal; outward surfaces
//! collapse them to one generic answer.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use depesche_core::{Clock, CoreError, KeyValueStore, Metrics, RateLimit, RateLimiter};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{hash_code, Channel, CodeRecord, CodeStore};

/// Errors surfaced by code issuance and validation.
///
/// Validation variants carry the internal reason for audit logging.
/// Callers facing the outside world must map every validation failure
/// to the same generic answer.
#[derive(Debug, Error)]
pub enum OtpError {
    /// Issuance caps for this owner are exhausted.
    #[error("issuance rate limit exceeded")]
    RateLimitExceeded,

    /// No active record, or the record is past its expiry.
    #[error("code expired or missing")]
    ExpiredOrMissing,

    /// The attempt budget for the active record is spent.
    #[error("code attempts exceeded")]
    AttemptsExceeded,

    /// The submitted code does not match the stored hash.
    #[error("code mismatch")]
    Mismatch,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] CoreError),
}

/// Issuance parameters.
#[derive(Debug, Clone)]
pub struct OtpConfig {
    /// Number of digits in an issued code.
    pub code_length: usize,
    /// Lifetime of an issued code.
    pub code_ttl: Duration,
    /// Validation attempts allowed per code.
    pub max_attempts: u32,
    /// Per-owner issuance cap over one hour.
    pub hourly_limit: RateLimit,
    /// Per-owner issuance cap over one day.
    pub daily_limit: RateLimit,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            code_ttl: Duration::from_secs(15 * 60),
            max_attempts: 5,
            // Issuance protects a security-sensitive resource, so both
            // caps reject when the store cannot be consulted.
            hourly_limit: RateLimit::fail_closed(5, Duration::from_secs(3600)),
            daily_limit: RateLimit::fail_closed(10, Duration::from_secs(86_400)),
        }
    }
}

/// Read-only view of the active record for an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeStatus {
    /// Whether no usable record exists.
    pub expired: bool,
    /// Time until the active record expires.
    pub time_remaining: Duration,
    /// Validation attempts left on the active record.
    pub attempts_remaining: u32,
}

impl CodeStatus {
    fn absent() -> Self {
        Self { expired: true, time_remaining: Duration::ZERO, attempts_remaining: 0 }
    }
}

/// Issues, validates, and clears one-time codes.
#[derive(Clone)]
pub struct OtpManager {
    codes: CodeStore,
    limiter: RateLimiter,
    config: OtpConfig,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OtpManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpManager").field("config", &self.config).finish_non_exhaustive()
    }
}

impl OtpManager {
    /// Creates a manager over the given store.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: OtpConfig,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codes: CodeStore::new(store.clone(), clock.clone()),
            limiter: RateLimiter::new(store, clock.clone()),
            config,
            metrics,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.clock.now_system())
    }

    /// The issuance parameters this manager was built with.
    pub fn config(&self) -> &OtpConfig {
        &self.config
    }

    /// Issues a fresh code for an owner.
    ///
    /// Both issuance caps must allow the request. A new issuance
    /// supersedes any prior active record for the owner. The returned
    /// plaintext exists nowhere else; only its hash is stored.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitExceeded` when either cap denies, or `Store`
    /// when the record cannot be persisted.
    pub async fn generate(
        &self,
        owner: &str,
        channel: Channel,
        ip: Option<IpAddr>,
    ) -> Result<String, OtpError> {
        let hourly = self
            .limiter
            .check_and_consume("otp-issue-hourly", owner, &self.config.hourly_limit)
            .await;
        let daily = self
            .limiter
            .check_and_consume("otp-issue-daily", owner, &self.config.daily_limit)
            .await;

        if !(hourly.allowed && daily.allowed) {
            self.metrics.otp.rate_limited.incr();
            warn!(owner, "code issuance denied by rate cap");
            return Err(OtpError::RateLimitExceeded);
        }

        let code = random_code(self.config.code_length);
        let issued_at = self.now();
        let record = CodeRecord {
            owner: owner.to_string(),
            code_hash: hash_code(&code),
            issued_at,
            expires_at: issued_at
                + chrono::Duration::from_std(self.config.code_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(900)),
            attempts_used: 0,
            max_attempts: self.config.max_attempts,
            channel,
            issuing_ip: ip,
        };
        self.codes.put(&record).await?;

        self.metrics.otp.issued.incr();
        debug!(owner, %channel, "code issued");
        Ok(code)
    }

    /// Validates a submitted code.
    ///
    /// Lookup order: absent or expired record, then attempt budget,
    /// then hash comparison. A match deletes the record and succeeds; a
    /// mismatch spends an attempt and persists the record. An exhausted
    /// record is deleted so re-issuance is the only way forward.
    ///
    /// # Errors
    ///
    /// Returns the specific internal reason; see `OtpError` for the
    /// outward-mapping obligation.
    pub async fn validate(&self, owner: &str, submitted: &str) -> Result<(), OtpError> {
        let Some(mut record) = self.codes.load(owner).await? else {
            self.metrics.otp.validation_failed.incr();
            debug!(owner, "validation failed: no active record");
            return Err(OtpError::ExpiredOrMissing);
        };

        if record.attempts_used >= record.max_attempts {
            self.codes.remove(owner).await?;
            self.metrics.otp.validation_failed.incr();
            warn!(owner, "validation failed: attempt budget spent, record burned");
            return Err(OtpError::AttemptsExceeded);
        }

        if hash_code(submitted) == record.code_hash {
            self.codes.remove(owner).await?;
            self.metrics.otp.validated.incr();
            debug!(owner, "code validated, record consumed");
            Ok(())
        } else {
            record.attempts_used += 1;
            self.codes.save_attempts(&record).await?;
            self.metrics.otp.validation_failed.incr();
            debug!(
                owner,
                attempts_used = record.attempts_used,
                max_attempts = record.max_attempts,
                "validation failed: code mismatch"
            );
            Err(OtpError::Mismatch)
        }
    }

    /// Read-only status for an owner. Never spends an attempt.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the backing store cannot be read.
    pub async fn status(&self, owner: &str) -> Result<CodeStatus, OtpError> {
        let Some(record) = self.codes.load(owner).await? else {
            return Ok(CodeStatus::absent());
        };
        let remaining = (record.expires_at - self.now()).to_std().unwrap_or(Duration::ZERO);
        Ok(CodeStatus {
            expired: false,
            time_remaining: remaining,
            attempts_remaining: record.max_attempts.saturating_sub(record.attempts_used),
        })
    }

    /// Removes all code state for an owner.
    ///
    /// # Errors
    ///
    /// Returns `Store` when the backing store cannot be written.
    pub async fn clear(&self, owner: &str) -> Result<(), OtpError> {
        self.codes.remove(owner).await?;
        Ok(())
    }
}

fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length).map(|_| char::from(b'0' + rng.random_range(0..10u8))).collect()
}
