//! Poll scheduler
//!
//! Drives the engine on a fixed interval. A failed cycle is logged and
//! counted as "nothing new"; only a shutdown request ends the loop, and it
//! is honored between cycles, never inside one.

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::engine::{CyclePhase, SyncEngine};

/// Cooperative shutdown signal shared between the poll loop and its owner
///
/// Triggering also wakes a loop that is sleeping between cycles.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().unwrap_or_else(|e| e.into_inner());
        *triggered = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep up to `timeout`; returns true if shutdown was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (triggered, _) = cvar
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(|e| e.into_inner());
        *triggered
    }
}

/// Where the poll loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Fetching,
    Persisting,
    Sleeping,
    ShuttingDown,
}

impl From<CyclePhase> for SchedulerPhase {
    fn from(phase: CyclePhase) -> Self {
        match phase {
            CyclePhase::Fetching => SchedulerPhase::Fetching,
            CyclePhase::Persisting => SchedulerPhase::Persisting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Sleep between cycles, whatever the outcome
    pub interval: Duration,
    /// Stop after this many cycles (None = run until shutdown)
    pub max_cycles: Option<usize>,
}

impl SchedulerOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            max_cycles: None,
        }
    }
}

/// Totals for one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub cycles: usize,
    pub failed_cycles: usize,
    pub messages_stored: usize,
}

pub struct PollScheduler {
    options: SchedulerOptions,
    phase: SchedulerPhase,
}

impl PollScheduler {
    pub fn new(options: SchedulerOptions) -> Self {
        Self {
            options,
            phase: SchedulerPhase::Idle,
        }
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: SchedulerPhase) {
        if self.phase != phase {
            debug!("Scheduler {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn cycles_exhausted(&self, cycles: usize) -> bool {
        self.options.max_cycles.is_some_and(|max| cycles >= max)
    }

    /// Poll until `shutdown` is triggered or `max_cycles` is reached
    pub fn run(&mut self, engine: &mut SyncEngine, shutdown: &Shutdown) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        info!(
            "Starting poll loop (interval {}s, watermark {})",
            self.options.interval.as_secs(),
            engine.watermark()
        );

        loop {
            if shutdown.is_triggered() || self.cycles_exhausted(report.cycles) {
                break;
            }

            match engine.store().count_by_status() {
                Ok(counts) => info!(
                    "Stored messages: {} total, {} processed, {} unprocessed",
                    counts.total, counts.processed, counts.unprocessed
                ),
                Err(e) => warn!("Failed to read message counts: {:#}", e),
            }

            let phase = &mut self.phase;
            let outcome = engine.run_cycle_observed(&mut |p| {
                let next = SchedulerPhase::from(p);
                debug!("Scheduler {:?} -> {:?}", *phase, next);
                *phase = next;
            });

            report.cycles += 1;
            match outcome {
                Ok(result) => report.messages_stored += result.stored_count,
                Err(e) => {
                    report.failed_cycles += 1;
                    error!("Sync cycle failed: {}", e);
                }
            }

            if self.cycles_exhausted(report.cycles) {
                break;
            }

            self.set_phase(SchedulerPhase::Sleeping);
            match next_check_time(self.options.interval) {
                Some(next) => info!("Next check at {}", next.format("%Y-%m-%d %H:%M:%S")),
                None => debug!("Next check time is out of range"),
            }

            if shutdown.wait_timeout(self.options.interval) {
                break;
            }
            self.set_phase(SchedulerPhase::Idle);
        }

        self.set_phase(SchedulerPhase::ShuttingDown);
        info!(
            "Poll loop stopped after {} cycles ({} failed, {} messages stored)",
            report.cycles, report.failed_cycles, report.messages_stored
        );
        report
    }
}

/// Wall-clock time of the next poll, if it can be represented
fn next_check_time(interval: Duration) -> Option<DateTime<Local>> {
    let interval = chrono::Duration::from_std(interval).ok()?;
    Local::now().checked_add_signed(interval)
}
