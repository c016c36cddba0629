//! Outbound transport contract and message types.
//!
//! The wire protocol of the outbound channel is not this crate's
//! business; it is reached exclusively through the narrow session
//! contract below. Sessions are expensive to establish, which is what
//! justifies pooling them.

use depesche_core::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::info;

use crate::error::{DeliveryError, Result};

/// Connection parameters for the outbound channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// Account name, when the gateway requires authentication.
    pub username: Option<String>,
    /// Account secret, when the gateway requires authentication.
    pub password: Option<String>,
    /// Whether to negotiate transport security.
    pub use_tls: bool,
    /// Timeout for establishing a session.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 2525,
            username: None,
            password: None,
            use_tls: true,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One outbound message before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Destination address (mailbox or phone number).
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
}

impl Message {
    /// Creates a message for the given recipient.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self { recipient: recipient.into(), subject: subject.into(), body: body.into() }
    }

    /// Content hash over subject and body, independent of recipient.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Assembled content ready for transmission, cached by content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    /// Subject line.
    pub subject: String,
    /// Final body text.
    pub body: String,
    /// Hash the content is cached under.
    pub content_hash: String,
}

impl RenderedContent {
    /// Renders a message into transmittable content.
    pub fn render(message: &Message) -> Self {
        Self {
            subject: message.subject.clone(),
            body: message.body.clone(),
            content_hash: message.content_hash(),
        }
    }
}

/// Checks that an address is plausibly deliverable.
///
/// Accepts mailbox addresses (`local@domain.tld`) and international
/// phone numbers (`+` followed by digits). Anything else is a permanent
/// failure; retrying cannot fix a malformed recipient.
///
/// # Errors
///
/// Returns `DeliveryError::Permanent` describing the defect.
pub fn validate_recipient(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(DeliveryError::permanent("empty recipient"));
    }
    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DeliveryError::permanent("recipient contains whitespace"));
    }

    if let Some(rest) = address.strip_prefix('+') {
        if rest.len() >= 7 && rest.len() <= 15 && rest.chars().all(|c| c.is_ascii_digit()) {
            return Ok(());
        }
        return Err(DeliveryError::permanent("malformed phone recipient"));
    }

    let mut parts = address.splitn(2, '@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(DeliveryError::permanent("malformed mailbox recipient"));
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(DeliveryError::permanent("malformed recipient domain"));
    }
    Ok(())
}

/// An established outbound session.
///
/// A session is owned by exactly one caller at a time; the pool hands
/// it out and takes it back. `probe` must be cheap; it runs before a
/// session is recycled.
pub trait MailSession: Send {
    /// Transmits one message. Transactional: either the gateway
    /// accepted it or an error is returned.
    fn send<'a>(
        &'a mut self,
        recipient: &'a str,
        content: &'a RenderedContent,
    ) -> BoxFuture<'a, Result<()>>;

    /// Lightweight health probe.
    fn probe(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// Factory for outbound sessions.
pub trait Transport: Send + Sync + 'static {
    /// Establishes a new session.
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn MailSession>>>;
}

/// Transport that records deliveries to the log instead of a wire.
///
/// Stands in wherever no concrete gateway is linked: local development
/// and the service binary's default wiring.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl LogTransport {
    /// Creates a new logging transport.
    pub fn new() -> Self {
        Self
    }
}

struct LogSession;

impl MailSession for LogSession {
    fn send<'a>(
        &'a mut self,
        recipient: &'a str,
        content: &'a RenderedContent,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            info!(recipient, subject = %content.subject, "message delivered to log");
            Ok(())
        })
    }

    fn probe(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl Transport for LogTransport {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn MailSession>>> {
        Box::pin(async { Ok(Box::new(LogSession) as Box<dyn MailSession>) })
    }
}

/// Outcome a `ScriptedTransport` session produces for one send.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// Accept and record the message.
    Deliver,
    /// Fail with the given error.
    Fail(DeliveryError),
}

/// A message a `ScriptedTransport` accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Body text.
    pub body: String,
}

/// Scriptable transport double for deterministic tests.
///
/// Sends pop the front of the outcome script; an empty script delivers.
/// Accepted messages are recorded for assertions. Sessions share the
/// script, so outcomes apply in submission order regardless of which
/// pooled session carries the send.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    outcomes: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<SendOutcome>>>,
    sent: std::sync::Arc<std::sync::Mutex<Vec<SentMessage>>>,
    connects: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

impl ScriptedTransport {
    /// Creates a transport that delivers everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one outcome to the script.
    pub fn script(&self, outcome: SendOutcome) {
        self.outcomes.lock().expect("script mutex poisoned").push_back(outcome);
    }

    /// Appends `count` copies of a failure to the script.
    pub fn script_failures(&self, count: usize, error: DeliveryError) {
        let mut outcomes = self.outcomes.lock().expect("script mutex poisoned");
        for _ in 0..count {
            outcomes.push_back(SendOutcome::Fail(error.clone()));
        }
    }

    /// Messages accepted so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent mutex poisoned").clone()
    }

    /// Sessions established so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(std::sync::atomic::Ordering::SeqCst)
    }
}

struct ScriptedSession {
    transport: ScriptedTransport,
}

impl MailSession for ScriptedSession {
    fn send<'a>(
        &'a mut self,
        recipient: &'a str,
        content: &'a RenderedContent,
    ) -> BoxFuture<'a, Result<()>> {
        let outcome = self
            .transport
            .outcomes
            .lock()
            .expect("script mutex poisoned")
            .pop_front()
            .unwrap_or(SendOutcome::Deliver);
        Box::pin(async move {
            match outcome {
                SendOutcome::Deliver => {
                    self.transport.sent.lock().expect("sent mutex poisoned").push(SentMessage {
                        recipient: recipient.to_string(),
                        subject: content.subject.clone(),
                        body: content.body.clone(),
                    });
                    Ok(())
                },
                SendOutcome::Fail(err) => Err(err),
            }
        })
    }

    fn probe(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self) -> BoxFuture<'static, Result<Box<dyn MailSession>>> {
        self.connects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let transport = self.clone();
        Box::pin(async move { Ok(Box::new(ScriptedSession { transport }) as Box<dyn MailSession>) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_recipients_validate() {
        assert!(validate_recipient("user@example.com").is_ok());
        assert!(validate_recipient("first.last@mail.example.org").is_ok());
    }

    #[test]
    fn phone_recipients_validate() {
        assert!(validate_recipient("+4915112345678").is_ok());
        assert!(validate_recipient("+12025550142").is_ok());
    }

    #[test]
    fn malformed_recipients_are_permanent_failures() {
        for bad in ["", "no-at-sign", "user@", "@domain.com", "user@domain", "user name@x.com",
            "user@.com", "+123", "+notdigits"]
        {
            let err = validate_recipient(bad).unwrap_err();
            assert!(matches!(err, DeliveryError::Permanent { .. }), "{bad} should be permanent");
        }
    }

    #[test]
    fn content_hash_ignores_recipient() {
        let a = Message::new("a@example.com", "Subject", "Body");
        let b = Message::new("b@example.com", "Subject", "Body");
        assert_eq!(a.content_hash(), b.content_hash());

        let c = Message::new("a@example.com", "Subject", "Other body");
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[tokio::test]
    async fn log_transport_accepts_sends() {
        let transport = LogTransport::new();
        let mut session = transport.connect().await.unwrap();
        let content = RenderedContent::render(&Message::new("a@example.com", "S", "B"));

        session.probe().await.unwrap();
        session.send("a@example.com", &content).await.unwrap();
    }
}
