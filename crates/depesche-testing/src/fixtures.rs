//! Small builders and parsers shared by the integration suites.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use depesche_core::{BoxFuture, CoreError};
use depesche_delivery::Message;
use depesche_reset::CredentialSink;

/// A throwaway mailbox address for an owner key.
pub fn address_for(owner: &str) -> String {
    format!("{owner}@example.com")
}

/// A plain notification message.
pub fn notification(recipient: &str) -> Message {
    Message::new(recipient, "Heads up", "Something happened.")
}

/// Pulls the security code out of a rendered code message body.
///
/// Codes are the first run of four or more consecutive digits.
pub fn extract_code(body: &str) -> Option<String> {
    let mut current = String::new();
    for c in body.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            if current.len() >= 4 {
                return Some(current);
            }
            current.clear();
        }
    }
    (current.len() >= 4).then_some(current)
}

/// Credential sink backed by a shared map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentials {
    secrets: Arc<Mutex<HashMap<String, String>>>,
}

impl InMemoryCredentials {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored secret for an owner, if any.
    pub fn secret(&self, owner: &str) -> Option<String> {
        self.secrets.lock().expect("credentials mutex poisoned").get(owner).cloned()
    }
}

impl CredentialSink for InMemoryCredentials {
    fn set_secret(&self, owner: &str, secret: &str) -> BoxFuture<'static, Result<(), CoreError>> {
        let this = self.clone();
        let owner = owner.to_string();
        let secret = secret.to_string();
        Box::pin(async move {
            this.secrets.lock().expect("credentials mutex poisoned").insert(owner, secret);
            Ok(())
        })
    }
}
