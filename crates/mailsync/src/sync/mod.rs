//! Sync engine for fetching and storing mail
//!
//! - [`bootstrap`]: reconcile the starting watermark and seen-set from the store
//! - [`engine`]: one idempotent fetch-filter-persist cycle
//! - [`scheduler`]: the fixed-interval poll loop and its shutdown signal

pub mod bootstrap;
pub mod engine;
pub mod retry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

pub use bootstrap::{bootstrap_state, initial_seen_set, initial_watermark};
pub use engine::{
    BatchOutcome, CyclePhase, CycleResult, PersistFailure, SyncContext, SyncCycleError,
    SyncEngine, SyncOptions, persist_batch, run_cycle,
};
pub use retry::RetryLedger;
pub use scheduler::{PollScheduler, SchedulerOptions, SchedulerPhase, SchedulerReport, Shutdown};
