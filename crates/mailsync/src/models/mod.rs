//! Domain models for synchronized messages

mod message;
mod sync_state;

pub use message::{MessageId, MessageRecord, MessageRecordBuilder, decode_body_lossy, display_subject};
pub use sync_state::{SyncState, Watermark};
