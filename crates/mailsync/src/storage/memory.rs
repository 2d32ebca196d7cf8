//! In-memory storage implementation

use anyhow::{Result, anyhow};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{MessageQuery, MessageStore, StatusCounts, UpsertStatus};
use crate::models::{MessageId, MessageRecord};

/// In-memory implementation of MessageStore
///
/// A HashMap keyed by message ID behind an RwLock.
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, MessageRecord>>,
}

impl InMemoryMessageStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<MessageId, MessageRecord>>> {
        self.messages
            .read()
            .map_err(|_| anyhow!("message store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<MessageId, MessageRecord>>> {
        self.messages
            .write()
            .map_err(|_| anyhow!("message store lock poisoned"))
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn upsert_message(&self, message: MessageRecord) -> Result<UpsertStatus> {
        let mut messages = self.write()?;
        match messages.get_mut(&message.id) {
            Some(existing) => {
                let processed = existing.processed;
                *existing = MessageRecord {
                    processed,
                    ..message
                };
                Ok(UpsertStatus::Updated)
            }
            None => {
                messages.insert(message.id.clone(), message);
                Ok(UpsertStatus::Inserted)
            }
        }
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<MessageRecord>> {
        Ok(self.read()?.get(id).cloned())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.read()?.contains_key(id))
    }

    fn most_recent_message(&self) -> Result<Option<MessageRecord>> {
        let messages = self.read()?;
        // Ties on received_at resolve to the greatest ID so the answer is stable
        Ok(messages
            .values()
            .max_by(|a, b| {
                a.received_at
                    .cmp(&b.received_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned())
    }

    fn all_message_ids(&self) -> Result<HashSet<MessageId>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    fn count_by_status(&self) -> Result<StatusCounts> {
        let messages = self.read()?;
        let processed = messages.values().filter(|m| m.processed).count();
        Ok(StatusCounts {
            total: messages.len(),
            processed,
            unprocessed: messages.len() - processed,
        })
    }

    fn list_messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        let messages = self.read()?;
        let mut matching: Vec<MessageRecord> = messages
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();

        // Sort by received_at descending
        matching.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    fn list_unprocessed(&self, limit: usize) -> Result<Vec<MessageRecord>> {
        let messages = self.read()?;
        let mut pending: Vec<MessageRecord> =
            messages.values().filter(|m| !m.processed).cloned().collect();
        pending.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    fn mark_processed(&self, ids: &[MessageId]) -> Result<usize> {
        let mut messages = self.write()?;
        let mut changed = 0;
        for id in ids {
            if let Some(message) = messages.get_mut(id)
                && !message.processed
            {
                message.processed = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn clear(&self) -> Result<()> {
        self.write()?.clear();
        Ok(())
    }
}
