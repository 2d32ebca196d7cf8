//! Message model representing a mailbox message as stored

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned message identifier, the dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single message record
///
/// This is the value exchanged between the mailbox source, the sync engine
/// and the store. Timestamps are held at second precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Provider message ID
    pub id: MessageId,
    /// Subject line (empty if the header was missing)
    pub subject: String,
    /// Sender as found in the From header
    pub sender: String,
    /// When the message was received, truncated to whole seconds
    pub received_at: DateTime<Utc>,
    /// Plain text body, always valid UTF-8
    pub body: String,
    /// Provider payload snapshot kept for audit
    pub raw_payload: serde_json::Value,
    /// Whether a downstream consumer has handled this message
    pub processed: bool,
}

impl MessageRecord {
    /// Create a new record builder
    pub fn builder(id: impl Into<MessageId>) -> MessageRecordBuilder {
        MessageRecordBuilder::new(id.into())
    }

    /// One-line summary used in logs and listings
    pub fn summary_line(&self) -> String {
        format!(
            "{} - {} - {}",
            display_subject(&self.subject),
            self.sender,
            self.received_at.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Placeholder for messages that arrive without a subject
pub fn display_subject(subject: &str) -> &str {
    if subject.trim().is_empty() {
        "(no subject)"
    } else {
        subject
    }
}

/// Decode raw body bytes into text, replacing undecodable sequences
pub fn decode_body_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Builder for creating MessageRecord instances
///
/// Missing fields get explicit defaults here, at the ingestion boundary.
pub struct MessageRecordBuilder {
    id: MessageId,
    subject: Option<String>,
    sender: Option<String>,
    received_at: Option<DateTime<Utc>>,
    body: String,
    raw_payload: serde_json::Value,
    processed: bool,
}

impl MessageRecordBuilder {
    fn new(id: MessageId) -> Self {
        Self {
            id,
            subject: None,
            sender: None,
            received_at: None,
            body: String::new(),
            raw_payload: serde_json::Value::Null,
            processed: false,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the body from raw bytes, replacing invalid UTF-8
    pub fn body_bytes(mut self, bytes: &[u8]) -> Self {
        self.body = decode_body_lossy(bytes);
        self
    }

    pub fn raw_payload(mut self, raw_payload: serde_json::Value) -> Self {
        self.raw_payload = raw_payload;
        self
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = processed;
        self
    }

    pub fn build(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            subject: self.subject.unwrap_or_default(),
            sender: self.sender.unwrap_or_default(),
            received_at: self
                .received_at
                .unwrap_or(DateTime::UNIX_EPOCH)
                .trunc_subsecs(0),
            body: self.body,
            raw_payload: self.raw_payload,
            processed: self.processed,
        }
    }
}
