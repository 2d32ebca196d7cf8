//! Mailbox source capability
//!
//! The sync engine only sees a source through [`MailboxSource`]; provider
//! authentication and wire protocol stay behind it.

use anyhow::Result;

use crate::models::{MessageRecord, Watermark};

/// Parameters for one fetch from a mailbox source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Lower bound; sources should return messages received at or after it
    pub since: Watermark,
    /// Optional cap on the number of records returned
    pub max_results: Option<usize>,
    /// Provider-specific filter string (e.g. "in:inbox")
    pub query: Option<String>,
}

impl FetchRequest {
    pub fn since(since: Watermark) -> Self {
        Self {
            since,
            max_results: None,
            query: None,
        }
    }
}

/// A finite, restartable source of message records
///
/// Implementations may return records older than `since` or records the
/// caller already has; the engine filters both.
pub trait MailboxSource: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<MessageRecord>>;
}
