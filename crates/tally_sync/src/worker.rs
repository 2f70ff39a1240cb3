//! Background scheduler for a [`SyncConnector`].
//!
//! One thread ticks a few times per second and decides whether a cycle
//! is owed: the poll interval elapsed, a manual trigger is pending, or
//! a backoff window just closed. The connector does the actual work;
//! the worker only owns the clock.

use crate::connector::SyncConnector;
use crate::store::RemoteStore;
use crate::transport::TallyTransport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Scheduler tick. Coarse enough to be cheap, fine enough that a
/// trigger is picked up promptly.
const TICK: Duration = Duration::from_millis(20);

/// Owns the scheduling thread for one connector.
///
/// The first polled cycle runs one poll interval after spawn; a
/// trigger runs one as soon as the next tick sees it. Dropping the
/// worker signals shutdown, cancels any in-flight cycle at its next
/// stage boundary, and joins the thread.
pub struct SyncWorker {
    shutdown: Arc<AtomicBool>,
    /// Requests cancellation on the connector at shutdown.
    cancel: Box<dyn Fn() + Send>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Spawns the scheduling thread.
    pub fn spawn<T, S>(connector: Arc<SyncConnector<T, S>>) -> Self
    where
        T: TallyTransport + 'static,
        S: RemoteStore + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let cancel_target = Arc::clone(&connector);
        let handle = std::thread::spawn(move || run_loop(&connector, &stop));
        Self {
            shutdown,
            cancel: Box::new(move || cancel_target.cancel()),
            handle: Some(handle),
        }
    }

    /// Signals the thread to stop, cancels an in-flight cycle at its
    /// next stage boundary (a commit already underway completes), and
    /// waits for the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        (self.cancel)();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            info!("sync worker stopped");
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run_loop<T, S>(connector: &SyncConnector<T, S>, shutdown: &AtomicBool)
where
    T: TallyTransport,
    S: RemoteStore,
{
    let poll_interval = connector.config().poll_interval;
    let mut next_poll = Instant::now() + poll_interval;

    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        let triggered = connector.take_trigger();
        // A pending failure streak retries as soon as its backoff
        // window closes, ahead of the regular poll cadence.
        let due = now >= next_poll || connector.consecutive_failures() > 0;
        let polled = due && !connector.is_halted() && connector.retry_due(now);

        if triggered || polled {
            match connector.run_cycle() {
                Ok(outcome) => {
                    debug!(
                        inserted = outcome.counts.inserted,
                        updated = outcome.counts.updated,
                        stale = outcome.counts.stale,
                        "scheduled cycle completed"
                    );
                }
                // The connector already logged and scheduled what
                // comes next; the loop just keeps ticking.
                Err(_) => {}
            }
            next_poll = Instant::now() + poll_interval;
        }

        std::thread::sleep(TICK);
    }
}
