//! Incremental sync engine
//!
//! One cycle fetches candidates since the watermark, drops the ones already
//! seen, upserts the rest one by one and reports what was confirmed. State
//! only moves for confirmed upserts.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use super::bootstrap::bootstrap_state;
use super::retry::RetryLedger;
use crate::models::{MessageId, MessageRecord, SyncState, Watermark};
use crate::source::{FetchRequest, MailboxSource};
use crate::storage::{MessageStore, UpsertStatus};

/// Knobs for a sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Cap on records per fetch
    pub max_results: Option<usize>,
    /// Provider filter string
    pub query: Option<String>,
    /// Processed flag given to every ingested record
    pub processed_on_ingest: bool,
    /// Failed upserts before a message is quarantined (0 = never)
    pub max_persist_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_results: None,
            query: None,
            processed_on_ingest: false,
            max_persist_attempts: 5,
        }
    }
}

/// Everything a cycle needs, constructed once at startup
pub struct SyncContext {
    pub source: Box<dyn MailboxSource>,
    pub store: Arc<dyn MessageStore>,
    pub options: SyncOptions,
}

impl SyncContext {
    pub fn new(
        source: Box<dyn MailboxSource>,
        store: Arc<dyn MessageStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
        }
    }
}

/// A cycle that could not run at all
#[derive(Debug, Error)]
pub enum SyncCycleError {
    #[error("fetch from mailbox source failed: {0:#}")]
    Fetch(anyhow::Error),
}

/// Step of a cycle, reported to observers as it is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Fetching,
    Persisting,
}

/// A single message whose upsert failed
#[derive(Debug, Clone)]
pub struct PersistFailure {
    pub id: MessageId,
    pub error: String,
}

/// Per-item results of persisting one batch
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub stored: Vec<(MessageId, DateTime<Utc>, UpsertStatus)>,
    pub failed: Vec<PersistFailure>,
}

impl BatchOutcome {
    /// Newest received_at among confirmed upserts
    pub fn newest_stored(&self) -> Option<DateTime<Utc>> {
        self.stored.iter().map(|(_, ts, _)| *ts).max()
    }

    pub fn oldest_stored(&self) -> Option<DateTime<Utc>> {
        self.stored.iter().map(|(_, ts, _)| *ts).min()
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleResult {
    /// Records returned by the source
    pub fetched: usize,
    /// Records left after dropping seen and quarantined IDs
    pub candidates: usize,
    /// Confirmed upserts
    pub stored_count: usize,
    /// Watermark after this cycle (never below the one before)
    pub new_watermark: Watermark,
    /// IDs confirmed stored in this cycle
    pub new_seen: Vec<MessageId>,
    /// IDs whose upsert failed in this cycle
    pub failed: Vec<MessageId>,
}

impl CycleResult {
    fn unchanged(fetched: usize, state: &SyncState) -> Self {
        Self {
            fetched,
            candidates: 0,
            stored_count: 0,
            new_watermark: state.watermark,
            new_seen: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Upsert each record, collecting a result per item
pub fn persist_batch(store: &dyn MessageStore, records: Vec<MessageRecord>) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for record in records {
        let id = record.id.clone();
        let received_at = record.received_at;
        match store.upsert_message(record) {
            Ok(status) => outcome.stored.push((id, received_at, status)),
            Err(e) => {
                warn!("Failed to store message {}: {:#}", id, e);
                outcome.failed.push(PersistFailure {
                    id,
                    error: format!("{:#}", e),
                });
            }
        }
    }

    outcome
}

/// Run one fetch-filter-persist pass without touching `state`
///
/// `on_phase` is told when the cycle starts fetching and when it starts
/// persisting.
pub fn run_cycle(
    ctx: &SyncContext,
    state: &SyncState,
    ledger: &RetryLedger,
    on_phase: &mut dyn FnMut(CyclePhase),
) -> Result<CycleResult, SyncCycleError> {
    on_phase(CyclePhase::Fetching);
    info!("Fetching messages since {}", state.watermark);

    let request = FetchRequest {
        since: state.watermark,
        max_results: ctx.options.max_results,
        query: ctx.options.query.clone(),
    };
    let fetched = ctx.source.fetch(&request).map_err(SyncCycleError::Fetch)?;
    let fetched_count = fetched.len();

    if let Some(cap) = request.max_results
        && fetched_count >= cap
    {
        warn!(
            "Fetch returned the full cap of {} messages; older messages in the window may remain unfetched",
            cap
        );
    }

    if fetched.is_empty() {
        info!("No messages returned by the source");
        return Ok(CycleResult::unchanged(0, state));
    }

    let mut candidates: Vec<MessageRecord> = Vec::new();
    let mut accepted: HashSet<MessageId> = HashSet::new();
    for mut record in fetched {
        if state.has_seen(&record.id) {
            continue;
        }
        if ledger.is_quarantined(&record.id) {
            debug!("Skipping quarantined message {}", record.id);
            continue;
        }
        // Duplicate IDs within one fetch are persisted once
        if !accepted.insert(record.id.clone()) {
            continue;
        }
        record.processed = ctx.options.processed_on_ingest;
        candidates.push(record);
    }

    if candidates.is_empty() {
        info!("All {} fetched messages were already stored", fetched_count);
        return Ok(CycleResult::unchanged(fetched_count, state));
    }

    info!(
        "Fetched {} messages, {} are new",
        fetched_count,
        candidates.len()
    );

    on_phase(CyclePhase::Persisting);
    let candidate_count = candidates.len();
    let outcome = persist_batch(ctx.store.as_ref(), candidates);

    let new_watermark = match outcome.newest_stored() {
        Some(newest) => state.watermark.advanced_to(newest),
        None => state.watermark,
    };

    if outcome.stored.is_empty() {
        warn!(
            "None of {} new messages could be stored; watermark stays at {}",
            candidate_count, state.watermark
        );
    } else {
        let inserted = outcome
            .stored
            .iter()
            .filter(|(_, _, status)| *status == UpsertStatus::Inserted)
            .count();
        info!(
            "Stored {} messages ({} inserted, {} overwritten, {} failed)",
            outcome.stored.len(),
            inserted,
            outcome.stored.len() - inserted,
            outcome.failed.len()
        );
        if let (Some(oldest), Some(newest)) = (outcome.oldest_stored(), outcome.newest_stored()) {
            debug!(
                "Stored messages span {} to {}",
                oldest.format("%Y-%m-%d %H:%M:%S"),
                newest.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(CycleResult {
        fetched: fetched_count,
        candidates: candidate_count,
        stored_count: outcome.stored.len(),
        new_watermark,
        new_seen: outcome.stored.into_iter().map(|(id, _, _)| id).collect(),
        failed: outcome.failed.into_iter().map(|f| f.id).collect(),
    })
}

/// Owns the sync context plus the in-memory watermark and seen-set
pub struct SyncEngine {
    ctx: SyncContext,
    state: SyncState,
    ledger: RetryLedger,
}

impl SyncEngine {
    /// Build an engine whose state is reconciled from the store
    pub fn bootstrap(ctx: SyncContext) -> Self {
        let state = bootstrap_state(ctx.store.as_ref());
        Self::with_state(ctx, state)
    }

    pub fn with_state(ctx: SyncContext, state: SyncState) -> Self {
        let ledger = RetryLedger::new(ctx.options.max_persist_attempts);
        Self { ctx, state, ledger }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn watermark(&self) -> Watermark {
        self.state.watermark
    }

    pub fn store(&self) -> &dyn MessageStore {
        self.ctx.store.as_ref()
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Run a cycle and fold its confirmed results into the engine state
    pub fn run_cycle(&mut self) -> Result<CycleResult, SyncCycleError> {
        self.run_cycle_observed(&mut |_| {})
    }

    pub fn run_cycle_observed(
        &mut self,
        on_phase: &mut dyn FnMut(CyclePhase),
    ) -> Result<CycleResult, SyncCycleError> {
        let result = run_cycle(&self.ctx, &self.state, &self.ledger, on_phase)?;
        self.apply(&result);
        Ok(result)
    }

    fn apply(&mut self, result: &CycleResult) {
        for id in &result.new_seen {
            self.ledger.record_success(id);
            self.state.seen.insert(id.clone());
        }

        for id in &result.failed {
            if self.ledger.record_failure(id) {
                warn!(
                    "Message {} failed to store {} times; quarantined until restart",
                    id, self.ctx.options.max_persist_attempts
                );
            }
        }

        let previous = self.state.watermark;
        self.state.watermark = previous.max(result.new_watermark);
        if self.state.watermark != previous {
            info!("Watermark advanced to {}", self.state.watermark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_support::{FaultyStore, ScriptedSource, at, make_message};

    fn engine_with(
        source: ScriptedSource,
        store: Arc<FaultyStore>,
        options: SyncOptions,
    ) -> SyncEngine {
        SyncEngine::bootstrap(SyncContext::new(Box::new(source), store, options))
    }

    #[test]
    fn test_scenario_only_new_message_is_upserted() {
        let store = Arc::new(FaultyStore::new());
        store.seed(make_message("m1", at(10)));

        let source = ScriptedSource::new(vec![Ok(vec![
            make_message("m1", at(10)),
            make_message("m2", at(11)),
        ])]);
        let requests = source.requests();

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        assert_eq!(engine.watermark(), Watermark::new(at(10)));

        let result = engine.run_cycle().unwrap();

        assert_eq!(result.stored_count, 1);
        assert_eq!(result.new_watermark, Watermark::new(at(11)));
        assert_eq!(result.new_seen, vec![MessageId::new("m2")]);
        assert_eq!(store.upsert_calls(), vec![MessageId::new("m2")]);
        assert_eq!(requests.lock().unwrap()[0].since, Watermark::new(at(10)));
        assert_eq!(engine.watermark(), Watermark::new(at(11)));
    }

    #[test]
    fn test_partial_failure_isolation() {
        let store = Arc::new(FaultyStore::new());
        store.fail_on("m2");

        // Newest first, as a provider would list them
        let source = ScriptedSource::new(vec![Ok(vec![
            make_message("m3", at(9)),
            make_message("m2", at(12)),
            make_message("m1", at(8)),
        ])]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let result = engine.run_cycle().unwrap();

        assert_eq!(result.stored_count, 2);
        assert_eq!(result.failed, vec![MessageId::new("m2")]);
        assert_eq!(result.new_watermark, Watermark::new(at(9)));

        let seen: HashSet<&str> = engine.state().seen.iter().map(|id| id.as_str()).collect();
        assert_eq!(seen, HashSet::from(["m1", "m3"]));
        assert!(!store.has_message(&MessageId::new("m2")).unwrap());
        assert_eq!(engine.ledger().failures(&MessageId::new("m2")), 1);
    }

    #[test]
    fn test_failed_message_is_retried_next_cycle() {
        let store = Arc::new(FaultyStore::new());
        store.fail_on("m1");

        let source = ScriptedSource::new(vec![
            Ok(vec![make_message("m1", at(10))]),
            Ok(vec![make_message("m1", at(10))]),
        ]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());

        let first = engine.run_cycle().unwrap();
        assert_eq!(first.stored_count, 0);
        assert!(engine.watermark().is_min());
        assert!(engine.state().seen.is_empty());

        store.recover("m1");
        let second = engine.run_cycle().unwrap();
        assert_eq!(second.stored_count, 1);
        assert_eq!(engine.watermark(), Watermark::new(at(10)));
        assert_eq!(engine.ledger().failures(&MessageId::new("m1")), 0);
    }

    #[test]
    fn test_dedup_completeness() {
        let store = Arc::new(FaultyStore::new());
        let source = ScriptedSource::new(vec![
            Ok(vec![make_message("x", at(10))]),
            Ok(vec![make_message("x", at(10))]),
        ]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        engine.run_cycle().unwrap();
        let second = engine.run_cycle().unwrap();

        assert_eq!(second.fetched, 1);
        assert_eq!(second.candidates, 0);
        assert_eq!(store.upsert_calls(), vec![MessageId::new("x")]);
    }

    #[test]
    fn test_watermark_never_regresses() {
        let store = Arc::new(FaultyStore::new());
        // Second batch arrives out of order, older than the first
        let source = ScriptedSource::new(vec![
            Ok(vec![make_message("a", at(12))]),
            Ok(vec![make_message("b", at(9)), make_message("c", at(11))]),
            Ok(Vec::new()),
        ]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let mut previous = engine.watermark();
        for _ in 0..3 {
            engine.run_cycle().unwrap();
            assert!(engine.watermark() >= previous);
            previous = engine.watermark();
        }

        assert_eq!(engine.watermark(), Watermark::new(at(12)));
        // Older messages are still stored even though they sit below the watermark
        assert!(store.has_message(&MessageId::new("b")).unwrap());
    }

    #[test]
    fn test_fetch_failure_leaves_state_untouched() {
        let store = Arc::new(FaultyStore::new());
        store.seed(make_message("m1", at(10)));
        let source = ScriptedSource::new(vec![Err(anyhow::anyhow!("provider unavailable"))]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let before = engine.state().clone();

        let err = engine.run_cycle().unwrap_err();
        assert!(matches!(err, SyncCycleError::Fetch(_)));
        assert!(err.to_string().contains("provider unavailable"));
        assert_eq!(engine.watermark(), before.watermark);
        assert_eq!(engine.state().seen, before.seen);
    }

    #[test]
    fn test_empty_store_fetches_everything() {
        let store = Arc::new(FaultyStore::new());
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let requests = source.requests();

        let options = SyncOptions {
            max_results: Some(50),
            query: Some("in:inbox".to_string()),
            ..Default::default()
        };
        let mut engine = engine_with(source, store, options);
        let result = engine.run_cycle().unwrap();

        assert_eq!(result.stored_count, 0);
        let sent = &requests.lock().unwrap()[0];
        assert!(sent.since.is_min());
        assert_eq!(sent.max_results, Some(50));
        assert_eq!(sent.query.as_deref(), Some("in:inbox"));
    }

    #[test]
    fn test_processed_flag_follows_ingest_policy() {
        let store = Arc::new(FaultyStore::new());
        let mut incoming = make_message("m1", at(10));
        incoming.processed = false;
        let source = ScriptedSource::new(vec![Ok(vec![incoming])]);

        let options = SyncOptions {
            processed_on_ingest: true,
            ..Default::default()
        };
        let mut engine = engine_with(source, store.clone(), options);
        engine.run_cycle().unwrap();

        let stored = store.get_message(&MessageId::new("m1")).unwrap().unwrap();
        assert!(stored.processed);
    }

    #[test]
    fn test_persistent_failure_is_quarantined() {
        let store = Arc::new(FaultyStore::new());
        store.fail_on("poison");

        let batches = (0..4)
            .map(|_| Ok(vec![make_message("poison", at(10))]))
            .collect();
        let source = ScriptedSource::new(batches);

        let options = SyncOptions {
            max_persist_attempts: 2,
            ..Default::default()
        };
        let mut engine = engine_with(source, store.clone(), options);

        for _ in 0..4 {
            engine.run_cycle().unwrap();
        }

        // Two attempts, then no further store calls
        assert_eq!(store.upsert_calls().len(), 2);
        assert!(engine.ledger().is_quarantined(&MessageId::new("poison")));
        assert!(!engine.state().has_seen(&MessageId::new("poison")));
        assert!(engine.watermark().is_min());
    }

    #[test]
    fn test_duplicate_ids_in_one_fetch_persist_once() {
        let store = Arc::new(FaultyStore::new());
        let source = ScriptedSource::new(vec![Ok(vec![
            make_message("d", at(10)),
            make_message("d", at(10)),
        ])]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let result = engine.run_cycle().unwrap();

        assert_eq!(result.candidates, 1);
        assert_eq!(store.upsert_calls().len(), 1);
    }

    #[test]
    fn test_duplicates_in_large_fetch_persist_once() {
        let store = Arc::new(FaultyStore::new());
        let fetched: Vec<MessageRecord> = (0..20_000)
            .map(|i| make_message(&format!("m{}", i % 10_000), at(10)))
            .collect();
        let source = ScriptedSource::new(vec![Ok(fetched)]);

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let result = engine.run_cycle().unwrap();

        assert_eq!(result.fetched, 20_000);
        assert_eq!(result.candidates, 10_000);
        assert_eq!(result.stored_count, 10_000);
        assert_eq!(store.upsert_calls().len(), 10_000);
    }

    #[test]
    fn test_resync_keeps_processed_flag_of_stored_message() {
        let store = Arc::new(FaultyStore::new());
        let mut handled = make_message("m1", at(10));
        handled.processed = true;
        store.seed(handled);

        // Empty state, as after a bootstrap that could not read the store
        let source = ScriptedSource::new(vec![Ok(vec![make_message("m1", at(10))])]);
        let ctx = SyncContext::new(Box::new(source), store.clone(), SyncOptions::default());
        let mut engine = SyncEngine::with_state(ctx, SyncState::default());

        let result = engine.run_cycle().unwrap();
        assert_eq!(result.stored_count, 1);

        let stored = store.get_message(&MessageId::new("m1")).unwrap().unwrap();
        assert!(stored.processed);
    }

    #[test]
    fn test_older_failure_below_advanced_watermark_is_retried_while_listed() {
        let store = Arc::new(FaultyStore::new());
        store.fail_on("m1");

        let source = ScriptedSource::new(vec![
            Ok(vec![make_message("m2", at(10)), make_message("m1", at(9))]),
            Ok(vec![make_message("m2", at(10)), make_message("m1", at(9))]),
        ]);
        let requests = source.requests();

        let mut engine = engine_with(source, store.clone(), SyncOptions::default());
        let first = engine.run_cycle().unwrap();

        // The newer message still moves the watermark past the failed one
        assert_eq!(first.failed, vec![MessageId::new("m1")]);
        assert_eq!(engine.watermark(), Watermark::new(at(10)));
        assert!(!engine.state().has_seen(&MessageId::new("m1")));

        store.recover("m1");
        let second = engine.run_cycle().unwrap();
        assert_eq!(second.new_seen, vec![MessageId::new("m1")]);
        assert_eq!(engine.watermark(), Watermark::new(at(10)));
        assert!(store.has_message(&MessageId::new("m1")).unwrap());
        assert_eq!(requests.lock().unwrap()[1].since, Watermark::new(at(10)));
    }

    #[test]
    fn test_phases_reported_in_order() {
        let store = Arc::new(FaultyStore::new());
        let source = ScriptedSource::new(vec![Ok(vec![make_message("m1", at(10))])]);
        let mut engine = engine_with(source, store, SyncOptions::default());

        let mut phases = Vec::new();
        engine
            .run_cycle_observed(&mut |phase| phases.push(phase))
            .unwrap();
        assert_eq!(phases, vec![CyclePhase::Fetching, CyclePhase::Persisting]);
    }
}
