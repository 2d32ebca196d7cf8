//! Gmail API HTTP client
//!
//! Provides methods for listing and fetching messages from the Gmail API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::time::Duration;

use super::api::{ListMessagesResponse, MessageRef};
use super::normalize_message;
use crate::models::{MessageId, MessageRecord, Watermark};
use crate::source::{FetchRequest, MailboxSource};

/// Build the Gmail `q` parameter from a filter and a lower bound
///
/// Gmail's `after:` operator takes epoch seconds; one second of slack keeps
/// messages received exactly at the watermark in the result. The minimum
/// watermark adds no bound at all.
pub fn build_search_query(filter: Option<&str>, since: Watermark) -> String {
    let mut terms: Vec<String> = Vec::new();

    if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
        terms.push(filter.to_string());
    }

    if !since.is_min() {
        let after = since.at().timestamp() - 1;
        if after >= 0 {
            terms.push(format!("after:{}", after));
        }
    }

    terms.join(" ")
}

/// Gmail API client for fetching messages
///
/// Holds a bearer access token obtained elsewhere; token issuance and
/// refresh are not handled here.
pub struct GmailClient {
    access_token: String,
    max_retries: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// Largest page the list endpoint accepts
    const MAX_PAGE_SIZE: usize = 500;

    /// Create a new Gmail client
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            max_retries: 3,
        }
    }

    /// Override how many attempts each message fetch gets
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    fn authorization(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// List one page of message IDs matching a search query
    ///
    /// # Arguments
    /// * `query` - Gmail search query (may be empty)
    /// * `max_results` - Maximum number of messages to return per page (1-500)
    /// * `page_token` - Optional page token for pagination
    pub fn list_messages(
        &self,
        query: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            Self::BASE_URL,
            max_results.clamp(1, Self::MAX_PAGE_SIZE)
        );

        if !query.is_empty() {
            url.push_str(&format!("&q={}", urlencoding::encode(query)));
        }

        if let Some(token) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }

        let mut response = ureq::get(&url)
            .header("Authorization", &self.authorization())
            .call()
            .context("Failed to send list messages request")?;

        let list: ListMessagesResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse list messages response")?;

        Ok(list)
    }

    /// List message IDs across pages until exhausted or `max_messages` is hit
    pub fn list_message_refs(
        &self,
        query: &str,
        max_messages: Option<usize>,
    ) -> Result<Vec<MessageRef>> {
        let mut all_messages: Vec<MessageRef> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = match max_messages {
                Some(max) if all_messages.len() >= max => break,
                Some(max) => (max - all_messages.len()).min(Self::MAX_PAGE_SIZE),
                None => Self::MAX_PAGE_SIZE,
            };

            let response = self.list_messages(query, page_size, page_token.as_deref())?;

            if let Some(messages) = response.messages {
                all_messages.extend(messages);
            }

            debug!("Listed {} message refs so far", all_messages.len());

            match response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        if let Some(max) = max_messages {
            all_messages.truncate(max);
        }

        Ok(all_messages)
    }

    /// Get the full message resource as raw JSON
    pub fn get_message(&self, id: &MessageId) -> Result<serde_json::Value> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            urlencoding::encode(id.as_str())
        );

        let mut response = ureq::get(&url)
            .header("Authorization", &self.authorization())
            .call()
            .with_context(|| format!("Failed to send get message request for {}", id))?;

        let message: serde_json::Value = response
            .body_mut()
            .read_json()
            .with_context(|| format!("Failed to parse message response for {}", id))?;

        Ok(message)
    }

    /// Get a message with exponential backoff retry
    fn get_message_with_retry(&self, id: &MessageId) -> Result<serde_json::Value> {
        let mut delay = Duration::from_millis(100);
        let mut attempt = 1;

        loop {
            match self.get_message(id) {
                Ok(msg) => return Ok(msg),
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    debug!("Fetch of {} failed (attempt {}): {:#}", id, attempt, e);
                    std::thread::sleep(delay + Duration::from_millis(rand_jitter()));
                    delay *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

impl MailboxSource for GmailClient {
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<MessageRecord>> {
        let query = build_search_query(request.query.as_deref(), request.since);
        debug!("Listing Gmail messages with q={:?}", query);

        let refs = self.list_message_refs(&query, request.max_results)?;
        let mut records = Vec::with_capacity(refs.len());

        for msg_ref in refs {
            let id = MessageId::new(msg_ref.id);
            // Failing the whole fetch keeps the watermark from passing a
            // message that could not be downloaded
            let raw = self
                .get_message_with_retry(&id)
                .with_context(|| format!("Failed to fetch message {}", id))?;

            match normalize_message(raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping message {}: normalize failed: {:#}", id, e),
            }
        }

        Ok(records)
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_search_query_from_beginning() {
        assert_eq!(build_search_query(None, Watermark::MIN), "");
        assert_eq!(
            build_search_query(Some("  in:inbox "), Watermark::MIN),
            "in:inbox"
        );
    }

    #[test]
    fn test_search_query_with_watermark() {
        let since = Watermark::new(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
        let expected_after = since.at().timestamp() - 1;

        assert_eq!(
            build_search_query(Some("from:billing"), since),
            format!("from:billing after:{}", expected_after)
        );
        assert_eq!(
            build_search_query(Some(""), since),
            format!("after:{}", expected_after)
        );
    }

    #[test]
    fn test_search_query_at_epoch_has_no_bound() {
        let since = Watermark::new(chrono::DateTime::UNIX_EPOCH);
        assert_eq!(build_search_query(None, since), "");
    }
}
