//! Mailsync crate - incremental mailbox synchronization
//!
//! This crate provides the sync service's business logic:
//! - Domain models (MessageRecord, Watermark, SyncState)
//! - Mailbox source abstraction and the Gmail REST source
//! - Storage trait with in-memory and SQLite backends
//! - Idempotent sync engine and the fixed-interval poll scheduler
//! - Read-only report queries for operators
//!
//! The crate is synchronous and does not pick an async runtime; the
//! binary decides how the poll loop is hosted.

pub mod config;
pub mod gmail;
pub mod models;
pub mod report;
pub mod source;
pub mod storage;
pub mod sync;

pub use config::{ConfigError, SyncConfig, access_token_from_env};
pub use gmail::{GmailClient, build_search_query, normalize_message};
pub use models::{MessageId, MessageRecord, MessageRecordBuilder, SyncState, Watermark};
pub use report::{ReportFilter, ReportWindow, format_message_detail, format_summary_list, list_report};
pub use source::{FetchRequest, MailboxSource};
pub use storage::{
    InMemoryMessageStore, MessageQuery, MessageStore, SqliteMessageStore, StatusCounts,
    UpsertStatus,
};
pub use sync::{
    // Cycle execution
    BatchOutcome, CycleResult, SyncContext, SyncCycleError, SyncEngine, SyncOptions,
    persist_batch, run_cycle,
    // Startup reconciliation
    bootstrap_state,
    // Poll loop
    PollScheduler, SchedulerOptions, SchedulerPhase, SchedulerReport, Shutdown,
};
