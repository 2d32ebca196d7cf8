//! Bounded retry bookkeeping for messages that fail to persist

use std::collections::{HashMap, HashSet};

use crate::models::MessageId;

/// Consecutive upsert failures per message, with quarantine past a limit
///
/// A quarantined message gets no further store calls for the rest of the
/// process lifetime. Counters live in memory only, so a restart retries it.
#[derive(Debug, Default)]
pub struct RetryLedger {
    /// 0 means retry forever
    max_attempts: u32,
    failures: HashMap<MessageId, u32>,
    quarantined: HashSet<MessageId>,
}

impl RetryLedger {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: HashMap::new(),
            quarantined: HashSet::new(),
        }
    }

    pub fn is_quarantined(&self, id: &MessageId) -> bool {
        self.quarantined.contains(id)
    }

    pub fn failures(&self, id: &MessageId) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined.len()
    }

    /// Count a failed upsert; returns true if this failure quarantined the message
    pub fn record_failure(&mut self, id: &MessageId) -> bool {
        let count = self.failures.entry(id.clone()).or_insert(0);
        *count += 1;

        if self.max_attempts > 0 && *count >= self.max_attempts {
            self.failures.remove(id);
            return self.quarantined.insert(id.clone());
        }
        false
    }

    pub fn record_success(&mut self, id: &MessageId) {
        self.failures.remove(id);
    }
}
