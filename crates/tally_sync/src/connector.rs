//! The sync connector: one Tally instance, one destination store.
//!
//! A cycle walks probe → fetch → reconcile → commit. Cancellation is
//! honored at stage boundaries only; once the commit stage starts, the
//! cycle runs to completion so the store and the sync state never
//! diverge. A Tally-reported application error halts automatic retry
//! until a manual trigger, because re-sending the same request cannot
//! fix a misconfigured company or a licensing fault.

use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::reconcile::{reconcile, FetchSnapshot, PlanCounts};
use crate::store::RemoteStore;
use crate::transport::TallyTransport;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tally_protocol::{parse_report, EnvelopeBuilder, ReportBatch, ReportKind};
use tracing::{debug, info, warn};

/// Where the connector currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// No cycle in progress, last cycle (if any) succeeded.
    Idle,
    /// Checking that Tally answers on its port.
    Probing,
    /// Requesting and parsing the three reports.
    Fetching,
    /// Diffing fetched records against the committed state.
    Reconciling,
    /// Writing the plan and the new state to the store.
    Committing,
    /// Last cycle failed; a retry may be scheduled.
    Errored,
}

impl ConnectorState {
    /// Whether a new cycle may start from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, ConnectorState::Idle | ConnectorState::Errored)
    }
}

/// Result of one successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Operations committed, by kind.
    pub counts: PlanCounts,
    /// Records the parser dropped for per-record failures.
    pub records_skipped: u64,
    /// Version of the state record the cycle committed.
    pub state_version: u64,
    /// Wall time the cycle took.
    pub duration: Duration,
}

/// Point-in-time view of the connector, for status surfaces.
#[derive(Debug, Clone)]
pub struct ConnectorStatus {
    /// Where the connector currently is.
    pub state: ConnectorState,
    /// Failed cycles since the last success.
    pub consecutive_failures: u32,
    /// Time until the scheduled retry, if one is pending.
    pub next_retry_in: Option<Duration>,
    /// Whether automatic retry is suspended.
    pub halted: bool,
    /// Result of the last successful cycle.
    pub last_outcome: Option<SyncOutcome>,
    /// Classification of the last error, cleared on success.
    pub last_error: Option<ErrorKind>,
}

/// Running totals across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that committed.
    pub cycles_completed: u64,
    /// Cycles that ended in an error.
    pub cycles_failed: u64,
    /// Parser-skipped records across all cycles.
    pub records_skipped: u64,
    /// Message of the most recent error, cleared on success.
    pub last_error: Option<String>,
    /// Classification of the most recent error, cleared on success.
    pub last_error_kind: Option<ErrorKind>,
    /// When the last successful cycle finished.
    pub last_sync_time: Option<Instant>,
    /// Outcome of the last successful cycle.
    pub last_outcome: Option<SyncOutcome>,
}

/// Drives sync cycles against one Tally instance.
///
/// The connector itself is passive: [`SyncConnector::run_cycle`] runs
/// one cycle on the calling thread. [`crate::SyncWorker`] owns the
/// schedule (polling, backoff, triggers).
pub struct SyncConnector<T: TallyTransport, S: RemoteStore> {
    config: SyncConfig,
    transport: T,
    store: S,
    state: RwLock<ConnectorState>,
    stats: RwLock<SyncStats>,
    /// Serializes cycles; a second caller gets `CycleInFlight`.
    cycle_guard: Mutex<()>,
    /// Consumed at the next stage boundary.
    cancelled: AtomicBool,
    /// An out-of-schedule cycle was requested. Repeated requests
    /// coalesce into one pending cycle.
    trigger_pending: AtomicBool,
    /// Automatic retry suspended until a manual trigger.
    halted: AtomicBool,
    consecutive_failures: AtomicU32,
    next_retry_at: Mutex<Option<Instant>>,
}

impl<T: TallyTransport, S: RemoteStore> SyncConnector<T, S> {
    /// Creates an idle connector.
    pub fn new(config: SyncConfig, transport: T, store: S) -> Self {
        Self {
            config,
            transport,
            store,
            state: RwLock::new(ConnectorState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle_guard: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            trigger_pending: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            next_retry_at: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectorState {
        *self.state.read()
    }

    /// Snapshot of the running totals.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> ConnectorStatus {
        let stats = self.stats.read();
        let now = Instant::now();
        ConnectorStatus {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            next_retry_in: (*self.next_retry_at.lock())
                .map(|at| at.saturating_duration_since(now)),
            halted: self.is_halted(),
            last_outcome: stats.last_outcome,
            last_error: stats.last_error_kind,
        }
    }

    /// The configuration this connector runs with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The transport this connector sends through.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The store this connector commits to.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Requests cancellation. The in-flight (or next) cycle stops at
    /// its next stage boundary; a commit already underway completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Requests an out-of-schedule cycle and lifts a halt. Safe to
    /// call at any time; requests made while a cycle runs coalesce
    /// into a single pending one.
    pub fn trigger_sync(&self) {
        self.trigger_pending.store(true, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);
        *self.next_retry_at.lock() = None;
    }

    /// Consumes the pending trigger, if any.
    pub fn take_trigger(&self) -> bool {
        self.trigger_pending.swap(false, Ordering::SeqCst)
    }

    /// Whether automatic retry is suspended.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Whether the backoff window (if any) has elapsed at `now`.
    pub fn retry_due(&self, now: Instant) -> bool {
        match *self.next_retry_at.lock() {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Consecutive failed cycles since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Runs one full cycle on the calling thread.
    pub fn run_cycle(&self) -> SyncResult<SyncOutcome> {
        let _cycle = self
            .cycle_guard
            .try_lock()
            .ok_or(SyncError::CycleInFlight)?;
        let start = Instant::now();

        self.set_state(ConnectorState::Probing);
        if !self.transport.is_running() {
            return self.fail(SyncError::Connection(format!(
                "no Tally instance answering at {}",
                self.config.tally_url
            )));
        }
        self.checkpoint()?;

        self.set_state(ConnectorState::Fetching);
        let previous = match self.store.load_state() {
            Ok(state) => state,
            Err(e) => return self.fail(e),
        };
        let mut snapshot = FetchSnapshot::new(Utc::now());
        for report in ReportKind::ALL {
            match self.fetch_report(report) {
                Ok(batch) => snapshot.absorb(batch),
                Err(e) => return self.fail(e),
            }
        }
        self.checkpoint()?;

        self.set_state(ConnectorState::Reconciling);
        let plan = reconcile(&snapshot, &previous);
        let next_state = plan.apply(&previous);
        self.checkpoint()?;

        // Past this point cancellation is no longer honored: the plan
        // and the state record must land together or not at all.
        self.set_state(ConnectorState::Committing);
        if let Err(e) = self.store.commit(&plan, &next_state) {
            return self.fail(e);
        }

        self.set_state(ConnectorState::Idle);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.next_retry_at.lock() = None;

        let counts = plan.counts();
        let outcome = SyncOutcome {
            counts,
            records_skipped: snapshot.skipped,
            state_version: next_state.version,
            duration: start.elapsed(),
        };
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            stats.records_skipped += snapshot.skipped;
            stats.last_error = None;
            stats.last_error_kind = None;
            stats.last_sync_time = Some(Instant::now());
            stats.last_outcome = Some(outcome);
        }
        info!(
            inserted = counts.inserted,
            updated = counts.updated,
            stale = counts.stale,
            skipped = snapshot.skipped,
            version = next_state.version,
            "sync cycle committed"
        );
        Ok(outcome)
    }

    /// Builds, sends, and parses one report request.
    fn fetch_report(&self, report: ReportKind) -> SyncResult<ReportBatch> {
        let envelope = EnvelopeBuilder::new(report).build()?;
        let response = self.transport.send(&envelope)?;
        let batch = parse_report(&response.body, report)?;
        for skip in &batch.skipped {
            warn!(
                report = report.report_name(),
                index = skip.index,
                reason = %skip.reason,
                "dropped malformed record"
            );
        }
        debug!(
            report = report.report_name(),
            records = batch.records.len(),
            "fetched report"
        );
        Ok(batch)
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state.write() = state;
    }

    /// Stage boundary: consumes a pending cancellation and returns the
    /// connector to idle without committing anything.
    fn checkpoint(&self) -> SyncResult<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            debug!("cycle cancelled at stage boundary");
            self.set_state(ConnectorState::Idle);
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Records a cycle failure: schedules a backoff for retryable
    /// errors, halts otherwise.
    fn fail(&self, error: SyncError) -> SyncResult<SyncOutcome> {
        self.set_state(ConnectorState::Errored);
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if error.is_retryable() {
            let delay = self.config.retry.delay_for_attempt(failures - 1);
            *self.next_retry_at.lock() = Some(Instant::now() + delay);
            warn!(
                %error,
                failures,
                delay_ms = delay.as_millis() as u64,
                "sync cycle failed, backing off"
            );
        } else {
            self.halted.store(true, Ordering::SeqCst);
            *self.next_retry_at.lock() = None;
            warn!(%error, "sync cycle failed, halting until manually triggered");
        }

        {
            let mut stats = self.stats.write();
            stats.cycles_failed += 1;
            stats.last_error = Some(error.to_string());
            stats.last_error_kind = Some(error.kind());
        }
        Err(error)
    }
}
