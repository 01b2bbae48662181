//! Periodic check scheduling.
//!
//! All background work (traffic sweeps, session integrity and idle checks)
//! runs from one ticking loop instead of independent timers. Tests drive the
//! loop by advancing a [`ManualClock`](crate::clock::ManualClock) and calling
//! [`Scheduler::run_due`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::clock::SharedClock;
use crate::error::{Result, WardenError};

/// A check the scheduler runs on a fixed cadence.
pub trait PeriodicCheck: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Run the check once. Must not block for long.
    fn run(&self);
}

struct Entry {
    check: Arc<dyn PeriodicCheck>,
    period: Duration,
    next_due: Instant,
}

/// Single-loop scheduler for registered checks.
pub struct Scheduler {
    clock: SharedClock,
    tick: Duration,
    entries: Mutex<Vec<Entry>>,
}

impl Scheduler {
    /// Create a scheduler ticking at `tick` resolution.
    pub fn new(clock: SharedClock, tick: Duration) -> Result<Self> {
        if tick.is_zero() {
            return Err(WardenError::Config("scheduler tick must be > 0".to_string()));
        }
        Ok(Self {
            clock,
            tick,
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Register a check. With `run_at_start` the first pass runs it
    /// immediately, otherwise it first runs one `period` from now.
    pub fn register(
        &self,
        check: Arc<dyn PeriodicCheck>,
        period: Duration,
        run_at_start: bool,
    ) -> Result<()> {
        if period.is_zero() {
            return Err(WardenError::Config(format!(
                "period for check '{}' must be > 0",
                check.name()
            )));
        }
        let now = self.clock.now();
        let Some(first_due) = now.checked_add(period) else {
            return Err(WardenError::Config(format!(
                "period for check '{}' is too long",
                check.name()
            )));
        };
        let next_due = if run_at_start { now } else { first_due };
        debug!(
            check = check.name(),
            period_ms = duration_ms(period),
            "Registered periodic check"
        );
        self.entries.lock().push(Entry {
            check,
            period,
            next_due,
        });
        Ok(())
    }

    /// Number of registered checks.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no checks are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Run every check that is due and return how many ran.
    ///
    /// A check that fell several periods behind runs once and is
    /// rescheduled one period from now.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<Arc<dyn PeriodicCheck>> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|entry| entry.next_due <= now)
                .map(|entry| {
                    entry.next_due = now + entry.period;
                    Arc::clone(&entry.check)
                })
                .collect()
        };

        for check in &due {
            trace!(check = check.name(), "Running periodic check");
            check.run();
        }
        due.len()
    }

    /// Drive the scheduler from a background task until shut down.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let tick = self.tick;
        let join = tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(tick_ms = duration_ms(tick), checks = self.len(), "Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_due();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.join.await {
            debug!(error = %err, "Scheduler task ended abnormally");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
