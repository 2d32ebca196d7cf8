//! Startup reconciliation
//!
//! Derives the initial watermark and seen-set from the store. Both reads
//! degrade instead of failing: a store that cannot be read yields a full
//! resync, which upsert idempotency keeps safe.

use log::{error, info};
use std::collections::HashSet;

use crate::models::{MessageId, SyncState, Watermark};
use crate::storage::MessageStore;

/// Watermark at the newest stored message, or the minimum if none/unreadable
pub fn initial_watermark(store: &dyn MessageStore) -> Watermark {
    match store.most_recent_message() {
        Ok(Some(latest)) => {
            info!(
                "Latest stored message {} is from {}",
                latest.id,
                latest.received_at.format("%Y-%m-%d %H:%M:%S")
            );
            Watermark::new(latest.received_at)
        }
        Ok(None) => {
            info!("No messages in store, starting from the beginning");
            Watermark::MIN
        }
        Err(e) => {
            error!("Failed to read latest stored message, resyncing from the beginning: {:#}", e);
            Watermark::MIN
        }
    }
}

/// Every stored message ID, or an empty set if the store cannot be read
pub fn initial_seen_set(store: &dyn MessageStore) -> HashSet<MessageId> {
    match store.all_message_ids() {
        Ok(ids) => {
            info!("Found {} stored message IDs", ids.len());
            ids
        }
        Err(e) => {
            error!("Failed to load stored message IDs, starting with an empty seen-set: {:#}", e);
            HashSet::new()
        }
    }
}

/// Build the starting sync state from the store
pub fn bootstrap_state(store: &dyn MessageStore) -> SyncState {
    SyncState::new(initial_watermark(store), initial_seen_set(store))
}
