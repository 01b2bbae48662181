//! Per-key traffic records and fixed-window accounting.

use std::time::{Duration, Instant};

use crate::error::{Result, WardenError};

/// A validated request limit over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    limit: u64,
    window: Duration,
}

impl Limit {
    /// Create a limit of `limit` requests per `window`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(WardenError::InvalidArgument("limit must be > 0".to_string()));
        }
        if window.is_zero() {
            return Err(WardenError::InvalidArgument(
                "window duration must be > 0".to_string(),
            ));
        }
        Ok(Self { limit, window })
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Outcome of admitting one request against a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Within the limit
    Allowed { count: u64, newly_suspicious: bool },
    /// The key was already blocked; the count was not touched
    Denied { count: u64, retry_after: Duration },
    /// This request pushed the count over the limit and started a block
    Blocked {
        count: u64,
        block: Duration,
        newly_suspicious: bool,
    },
}

/// Traffic state for one key.
///
/// `count` only grows within a window. Crossing the window boundary resets
/// the count, the suspicion flag and any lapsed block.
#[derive(Debug, Clone)]
pub struct TrafficRecord {
    count: u64,
    window_start: Instant,
    window: Duration,
    suspicious: bool,
    blocked_until: Option<Instant>,
    referenced: bool,
}

impl TrafficRecord {
    pub(crate) fn new(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
            suspicious: false,
            blocked_until: None,
            referenced: false,
        }
    }

    /// Requests observed in the current window.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether the key crossed the suspicion threshold in this window.
    pub fn is_suspicious(&self) -> bool {
        self.suspicious
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Time left on the block at `now`, zero when not blocked.
    pub fn remaining_block(&self, now: Instant) -> Duration {
        self.blocked_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Note a check against an already tracked key.
    pub(crate) fn mark_referenced(&mut self) {
        self.referenced = true;
    }

    /// Clear the reference bit, returning whether it was set.
    pub(crate) fn take_reference(&mut self) -> bool {
        std::mem::replace(&mut self.referenced, false)
    }

    fn window_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) > window
    }

    fn reset_window(&mut self, now: Instant, window: Duration) {
        self.count = 0;
        self.window_start = now;
        self.window = window;
        self.suspicious = false;
        self.blocked_until = None;
    }

    /// A stale record would be reset by its next check, so dropping it is
    /// indistinguishable from keeping it.
    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        self.window_expired(now, self.window) && !self.is_blocked(now)
    }

    /// Apply one request as a single read-modify-write.
    pub(crate) fn admit(
        &mut self,
        now: Instant,
        limit: &Limit,
        suspicion_threshold: u64,
        block_duration: Duration,
    ) -> Admission {
        if self.is_blocked(now) {
            return Admission::Denied {
                count: self.count,
                retry_after: self.remaining_block(now),
            };
        }

        if self.window_expired(now, limit.window()) {
            self.reset_window(now, limit.window());
        }

        self.count = self.count.saturating_add(1);

        let newly_suspicious = !self.suspicious && self.count > suspicion_threshold;
        if newly_suspicious {
            self.suspicious = true;
        }

        if self.count > limit.limit() {
            self.blocked_until = Some(now + block_duration);
            return Admission::Blocked {
                count: self.count,
                block: block_duration,
                newly_suspicious,
            };
        }

        Admission::Allowed {
            count: self.count,
            newly_suspicious,
        }
    }

    /// Point-in-time copy of the record for metrics.
    pub fn snapshot(&self, key: &str, now: Instant) -> TrafficSnapshot {
        TrafficSnapshot {
            key: key.to_string(),
            count: self.count,
            window: self.window,
            window_age: now.saturating_duration_since(self.window_start),
            suspicious: self.suspicious,
            blocked_for: self.is_blocked(now).then(|| self.remaining_block(now)),
        }
    }
}

/// Read-only view of a traffic record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Record key
    pub key: String,
    /// Requests counted in the current window
    pub count: u64,
    /// Window length last applied to the key
    pub window: Duration,
    /// Time since the current window started
    pub window_age: Duration,
    /// Suspicion flag for the current window
    pub suspicious: bool,
    /// Remaining block time, if blocked
    pub blocked_for: Option<Duration>,
}
