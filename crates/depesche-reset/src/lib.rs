//! End-to-end credential-reset orchestration.
//!
//! Composes the code manager and the dispatcher into the caller-facing
//! flow: initiate issues a code and queues its delivery, validate
//! checks a submission and records a short-lived verified marker, and
//! complete applies the new secret once against a live marker.
//!
//! Initiation always returns the same acknowledgment. Whether the owner
//! exists, issuance was rate-capped, or the queue pushed back is
//! visible in logs and metrics, never in the response shape.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use depesche_core::{BoxFuture, Clock, CoreError, KeyValueStore};
use depesche_delivery::{Dispatcher, Message};
use depesche_otp::{Channel, CodeStatus, OtpError, OtpManager};
use tracing::{debug, info, warn};

/// Applies a newly chosen secret for an owner.
///
/// Business-entity persistence lives outside this subsystem; the
/// orchestrator only requires this narrow seam.
pub trait CredentialSink: Send + Sync + 'static {
    /// Stores the new secret.
    fn set_secret(&self, owner: &str, secret: &str) -> BoxFuture<'static, Result<(), CoreError>>;
}

/// Orchestrator behavior knobs.
#[derive(Debug, Clone)]
pub struct ResetConfig {
    /// How long a successful validation stays usable by `complete`.
    pub verified_ttl: Duration,
    /// Channel reset codes are issued for.
    pub channel: Channel,
    /// Subject line of the code message.
    pub subject: String,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            verified_ttl: Duration::from_secs(600),
            channel: Channel::Email,
            subject: "Your security code".to_string(),
        }
    }
}

/// The uniform acknowledgment `initiate` returns.
///
/// Identical for every outcome so neither account existence nor
/// internal failures leak through the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetAck;

impl ResetAck {
    /// The one message every initiation answers with.
    pub const MESSAGE: &'static str =
        "If the account exists, a security code is on its way.";
}

impl std::fmt::Display for ResetAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(Self::MESSAGE)
    }
}

fn verified_key(owner: &str) -> String {
    format!("otp:verified:{owner}")
}

/// Composes otp issuance and asynchronous dispatch into the reset flow.
pub struct ResetOrchestrator {
    otp: Arc<OtpManager>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn KeyValueStore>,
    credentials: Arc<dyn CredentialSink>,
    config: ResetConfig,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResetOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetOrchestrator").field("config", &self.config).finish_non_exhaustive()
    }
}

impl ResetOrchestrator {
    /// Wires the orchestrator over its collaborators.
    pub fn new(
        otp: Arc<OtpManager>,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn KeyValueStore>,
        credentials: Arc<dyn CredentialSink>,
        config: ResetConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { otp, dispatcher, store, credentials, config, clock }
    }

    /// Starts a reset flow for an owner.
    ///
    /// Issues a code and queues its delivery to `address`. Every
    /// internal outcome answers with the same `ResetAck`; the caller
    /// never blocks on network I/O.
    pub async fn initiate(&self, owner: &str, address: &str, ip: Option<IpAddr>) -> ResetAck {
        match self.otp.generate(owner, self.config.channel, ip).await {
            Ok(code) => {
                let message = self.code_message(address, &code);
                match self.dispatcher.send_code_async(owner, message).await {
                    Ok(task_id) => {
                        debug!(owner, task_id = %task_id, "reset code dispatch queued");
                    },
                    Err(err) => {
                        // Queue backpressure and malformed addresses are
                        // logged and counted, never echoed to the caller.
                        warn!(owner, error = %err, "reset code dispatch rejected");
                    },
                }
            },
            Err(err) => {
                warn!(owner, error = %err, "reset initiation suppressed");
            },
        }
        ResetAck
    }

    /// Checks a submitted code.
    ///
    /// On success a short-lived verified marker is recorded for the
    /// owner. Every failure collapses to `false`; the specific reason
    /// stays in internal audit logs.
    pub async fn validate(&self, owner: &str, code: &str) -> bool {
        match self.otp.validate(owner, code).await {
            Ok(()) => {
                let stamp = DateTime::<Utc>::from(self.clock.now_system()).to_rfc3339();
                match self
                    .store
                    .set_with_ttl(&verified_key(owner), &stamp, self.config.verified_ttl)
                    .await
                {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(owner, error = %err, "verified marker could not be stored");
                        false
                    },
                }
            },
            Err(err) => {
                debug!(owner, reason = %err, "code validation failed");
                false
            },
        }
    }

    /// Applies a new secret for an owner.
    ///
    /// Requires a live verified marker from the same flow. On success
    /// the marker and all code state for the owner are cleared.
    pub async fn complete(&self, owner: &str, new_secret: &str) -> bool {
        let marker = match self.store.get(&verified_key(owner)).await {
            Ok(marker) => marker,
            Err(err) => {
                warn!(owner, error = %err, "verified marker could not be read");
                return false;
            },
        };
        if marker.is_none() {
            debug!(owner, "completion rejected: no live verified marker");
            return false;
        }

        if let Err(err) = self.credentials.set_secret(owner, new_secret).await {
            warn!(owner, error = %err, "secret could not be applied");
            return false;
        }

        if let Err(err) = self.store.delete(&verified_key(owner)).await {
            warn!(owner, error = %err, "verified marker could not be cleared");
        }
        if let Err(err) = self.otp.clear(owner).await {
            warn!(owner, error = %err, "code state could not be cleared");
        }

        info!(owner, "credential reset completed");
        true
    }

    /// Read-only reset status for an owner.
    ///
    /// # Errors
    ///
    /// Returns a store error when the backing store cannot be read.
    pub async fn status(&self, owner: &str) -> Result<CodeStatus, OtpError> {
        self.otp.status(owner).await
    }

    fn code_message(&self, address: &str, code: &str) -> Message {
        let minutes = self.otp.config().code_ttl.as_secs() / 60;
        let body =
            format!("Your security code is {code}. It expires in {minutes} minutes.");
        Message::new(address, self.config.subject.clone(), body)
    }
}
