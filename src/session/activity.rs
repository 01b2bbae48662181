//! Idle tracking.

use std::time::{Duration, Instant};

/// Last-activity clock with a debounce on updates.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last_activity_at: Instant,
    timeout: Duration,
    debounce: Duration,
}

impl ActivityClock {
    /// Start the clock at `now`.
    pub fn new(now: Instant, timeout: Duration, debounce: Duration) -> Self {
        Self {
            last_activity_at: now,
            timeout,
            debounce,
        }
    }

    /// Advance the clock unless the last update was within the debounce
    /// window. Returns whether it advanced.
    pub fn record(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_activity_at) < self.debounce {
            return false;
        }
        self.last_activity_at = now;
        true
    }

    /// Restart the clock at `now` regardless of the debounce window.
    pub fn restart(&mut self, now: Instant) {
        self.last_activity_at = now;
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// Whether the session is still within its idle allowance.
    pub fn is_within_timeout(&self, now: Instant) -> bool {
        self.idle_for(now) <= self.timeout
    }

    /// Configured idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_debounce_collapses_bursts() {
        let start = Instant::now();
        let mut clock = ActivityClock::new(start, 30 * MINUTE, Duration::from_secs(1));

        assert!(!clock.record(start + Duration::from_millis(500)));
        assert!(clock.record(start + Duration::from_secs(1)));
        assert!(!clock.record(start + Duration::from_millis(1_200)));
        assert!(!clock.record(start + Duration::from_millis(1_900)));
        assert!(clock.record(start + Duration::from_secs(2)));
        assert_eq!(clock.idle_for(start + Duration::from_secs(5)), Duration::from_secs(3));
    }

    #[test]
    fn test_timeout_boundary() {
        let start = Instant::now();
        let clock = ActivityClock::new(start, 30 * MINUTE, Duration::from_secs(1));
        assert!(clock.is_within_timeout(start + 29 * MINUTE));
        assert!(clock.is_within_timeout(start + 30 * MINUTE));
        assert!(!clock.is_within_timeout(start + 31 * MINUTE));
    }
}
