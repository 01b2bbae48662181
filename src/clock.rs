//! Time sources.
//!
//! Every time-dependent component reads the time through [`Clock`] so that
//! windows, blocks, recovery timeouts and idle timeouts can be fast-forwarded
//! deterministically in tests with [`ManualClock`].

use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Port for obtaining the current monotonic time.
pub trait Clock: Send + Sync + Debug {
    /// Get the current instant.
    fn now(&self) -> Instant;
}

/// Shareable clock reference.
pub type SharedClock = Arc<dyn Clock>;

/// System clock implementation using `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }

    /// Create a shareable system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so advancing one clone advances
/// every component holding another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a manual clock starting at a specific instant.
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a manual clock starting now.
    pub fn starting_now() -> Self {
        Self::new(Instant::now())
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: Duration) {
        *self.current.lock() += duration;
    }

    /// Set the clock to a specific instant.
    pub fn set(&self, instant: Instant) {
        *self.current.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}
