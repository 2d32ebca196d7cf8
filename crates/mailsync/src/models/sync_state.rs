//! In-memory sync progress: the watermark and the seen-set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use super::MessageId;

/// Lower bound of the next fetch
///
/// Messages received at or after this instant may still be unseen. The
/// minimum value means "fetch everything".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(DateTime<Utc>);

impl Watermark {
    /// The "nothing synced yet" watermark
    pub const MIN: Watermark = Watermark(DateTime::<Utc>::MIN_UTC);

    pub fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::MIN
    }

    /// Move forward to `candidate` if it is newer; never moves backwards
    pub fn advanced_to(self, candidate: DateTime<Utc>) -> Self {
        if candidate > self.0 { Self(candidate) } else { self }
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            f.write_str("(beginning)")
        } else {
            write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
        }
    }
}

/// Sync progress held for one process lifetime
///
/// Built at bootstrap from the store and discarded on exit; there is no
/// separate checkpoint file.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub watermark: Watermark,
    pub seen: HashSet<MessageId>,
}

impl SyncState {
    pub fn new(watermark: Watermark, seen: HashSet<MessageId>) -> Self {
        Self { watermark, seen }
    }

    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }
}
