//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{MessageId, MessageRecord};

/// What an upsert did to the stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    /// No record existed for this ID
    Inserted,
    /// An existing record was overwritten
    Updated,
}

/// Aggregate message counts by processed status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub processed: usize,
    pub unprocessed: usize,
}

/// Filter and pagination for listing stored messages
///
/// Results are ordered by received_at descending (newest first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages received at or after this instant
    pub received_since: Option<DateTime<Utc>>,
    /// Only messages received at or before this instant
    pub received_until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the sender
    pub sender_contains: Option<String>,
    /// Only messages with this processed flag
    pub processed: Option<bool>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            received_since: None,
            received_until: None,
            sender_contains: None,
            processed: None,
            limit: usize::MAX,
            offset: 0,
        }
    }
}

impl MessageQuery {
    /// Check a record against the filter fields (pagination not applied)
    pub fn matches(&self, message: &MessageRecord) -> bool {
        if self
            .received_since
            .is_some_and(|since| message.received_at < since)
        {
            return false;
        }
        if self
            .received_until
            .is_some_and(|until| message.received_at > until)
        {
            return false;
        }
        if let Some(needle) = &self.sender_contains
            && !message
                .sender
                .to_lowercase()
                .contains(&needle.to_lowercase())
        {
            return false;
        }
        if self.processed.is_some_and(|p| message.processed != p) {
            return false;
        }
        true
    }
}

/// Trait for message storage operations
///
/// Every write is keyed by message ID, so concurrent writers converge
/// with last-write-wins and the store never holds two records for one ID.
pub trait MessageStore: Send + Sync {
    /// Insert or overwrite the record with this message's ID
    ///
    /// An overwrite replaces content but keeps the stored `processed` flag;
    /// the incoming flag only applies on insert.
    fn upsert_message(&self, message: MessageRecord) -> Result<UpsertStatus>;

    /// Get a message by ID
    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>>;

    /// Check if a message exists
    fn has_message(&self, id: &MessageId) -> Result<bool>;

    /// The stored message with the latest received_at, if any
    fn most_recent_message(&self) -> Result<Option<MessageRecord>>;

    /// IDs of every stored message
    fn all_message_ids(&self) -> Result<HashSet<MessageId>>;

    /// Count messages by processed status
    fn count_by_status(&self) -> Result<StatusCounts>;

    /// List messages matching a query
    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>>;

    /// Unprocessed messages, oldest first
    fn list_unprocessed(&self, limit: usize) -> Result<Vec<MessageRecord>>;

    /// Set processed = true; returns how many records changed
    fn mark_processed(&self, ids: &[MessageId]) -> Result<usize>;

    /// Clear all data (for testing)
    fn clear(&self) -> Result<()>;
}
