//! Test doubles for the sync engine and scheduler

use anyhow::{Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::models::{MessageId, MessageRecord};
use crate::source::{FetchRequest, MailboxSource};
use crate::storage::{InMemoryMessageStore, MessageQuery, MessageStore, StatusCounts, UpsertStatus};

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

pub fn make_message(id: &str, received_at: DateTime<Utc>) -> MessageRecord {
    MessageRecord::builder(id)
        .subject(format!("Subject {}", id))
        .sender("sender@example.com")
        .received_at(received_at)
        .body(format!("Body for {}", id))
        .build()
}

/// Returns queued fetch results in order, then empty batches
pub struct ScriptedSource {
    batches: Mutex<VecDeque<Result<Vec<MessageRecord>>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedSource {
    pub fn new(batches: Vec<Result<Vec<MessageRecord>>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle to every request the source has received
    pub fn requests(&self) -> Arc<Mutex<Vec<FetchRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl MailboxSource for ScriptedSource {
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<MessageRecord>> {
        self.requests.lock().unwrap().push(request.clone());
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// In-memory store that fails upserts for chosen IDs and records every attempt
pub struct FaultyStore {
    inner: InMemoryMessageStore,
    failing: Mutex<HashSet<MessageId>>,
    upserts: Mutex<Vec<MessageId>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryMessageStore::new(),
            failing: Mutex::new(HashSet::new()),
            upserts: Mutex::new(Vec::new()),
        }
    }

    /// Insert directly, bypassing fault injection and call recording
    pub fn seed(&self, message: MessageRecord) {
        self.inner.upsert_message(message).unwrap();
    }

    pub fn fail_on(&self, id: &str) {
        self.failing.lock().unwrap().insert(MessageId::new(id));
    }

    pub fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(&MessageId::new(id));
    }

    /// IDs passed to upsert_message, in call order
    pub fn upsert_calls(&self) -> Vec<MessageId> {
        self.upserts.lock().unwrap().clone()
    }
}

impl MessageStore for FaultyStore {
    fn upsert_message(&self, message: MessageRecord) -> Result<UpsertStatus> {
        self.upserts.lock().unwrap().push(message.id.clone());
        if self.failing.lock().unwrap().contains(&message.id) {
            bail!("write rejected for {}", message.id);
        }
        self.inner.upsert_message(message)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        self.inner.get_message(id)
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        self.inner.has_message(id)
    }

    fn most_recent_message(&self) -> Result<Option<MessageRecord>> {
        self.inner.most_recent_message()
    }

    fn all_message_ids(&self) -> Result<HashSet<MessageId>> {
        self.inner.all_message_ids()
    }

    fn count_by_status(&self) -> Result<StatusCounts> {
        self.inner.count_by_status()
    }

    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        self.inner.list_messages(query)
    }

    fn list_unprocessed(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        self.inner.list_unprocessed(limit)
    }

    fn mark_processed(&self, ids: &[MessageId]) -> Result<usize> {
        self.inner.mark_processed(ids)
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }
}
