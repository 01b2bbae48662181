//! Core rate limiter implementation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::audit::{AuditEvent, AuditKind, Severity, SharedSink};
use crate::clock::SharedClock;
use crate::config::RateLimitingConfig;
use crate::error::Result;
use crate::scheduler::PeriodicCheck;

use super::key::TrafficKey;
use super::record::{Admission, Limit, TrafficRecord, TrafficSnapshot};

/// Most queue entries one eviction attempt will inspect.
const EVICTION_SCAN_LIMIT: usize = 32;

/// Fixed-window rate limiter with suspicion tracking and temporary blocks.
///
/// Each key's record is updated inside its map shard's lock, so decisions
/// for one key are applied in arrival order. Windows are fixed, not
/// sliding: a caller can land up to twice the limit across a window
/// boundary. That approximation is accepted.
#[derive(Debug)]
pub struct RateLimiter {
    /// Traffic records indexed by key
    records: DashMap<String, TrafficRecord>,
    /// Keys in insertion order, cycled for second-chance eviction
    eviction_queue: Mutex<VecDeque<String>>,
    config: RateLimitingConfig,
    default_limit: Limit,
    clock: SharedClock,
    sink: SharedSink,
}

impl RateLimiter {
    /// Create a rate limiter, validating its configuration eagerly.
    pub fn new(config: RateLimitingConfig, clock: SharedClock, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let default_limit = Limit::new(config.max_requests_per_window, config.window())?;
        Ok(Self {
            records: DashMap::new(),
            eviction_queue: Mutex::new(VecDeque::new()),
            config,
            default_limit,
            clock,
            sink,
        })
    }

    /// The limit applied by [`check_default`](Self::check_default).
    pub fn default_limit(&self) -> Limit {
        self.default_limit
    }

    /// Validate raw arguments, then [`check`](Self::check).
    pub fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        let key = TrafficKey::new(key)?;
        let limit = Limit::new(limit, window)?;
        Ok(self.check(&key, &limit))
    }

    /// Check against the configured default limit.
    pub fn check_default(&self, key: &TrafficKey) -> bool {
        self.check(key, &self.default_limit)
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub fn check(&self, key: &TrafficKey, limit: &Limit) -> bool {
        let now = self.clock.now();
        self.make_room(key.as_str());

        let threshold = self.suspicion_threshold(limit);
        let block = self.config.block_duration();
        let (admission, inserted) = match self.records.entry(key.as_str().to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.mark_referenced();
                (record.admit(now, limit, threshold, block), false)
            }
            Entry::Vacant(entry) => {
                let mut record = entry.insert(TrafficRecord::new(now, limit.window()));
                (record.admit(now, limit, threshold, block), true)
            }
        };
        if inserted {
            self.eviction_queue.lock().push_back(key.as_str().to_string());
        }

        trace!(key = %key, admission = ?admission, "Checked rate limit");

        match admission {
            Admission::Allowed {
                count,
                newly_suspicious,
            } => {
                if newly_suspicious {
                    self.flag_suspicious(key, count, threshold);
                }
                true
            }
            Admission::Denied { count, retry_after } => {
                debug!(key = %key, count, "Request denied while blocked");
                self.sink.emit(
                    AuditEvent::new(AuditKind::RequestDenied, Severity::Warning, key.as_str())
                        .with("count", count)
                        .with("threshold", limit.limit())
                        .with("retry_after_ms", duration_ms(retry_after)),
                );
                false
            }
            Admission::Blocked {
                count,
                block,
                newly_suspicious,
            } => {
                if newly_suspicious {
                    self.flag_suspicious(key, count, threshold);
                }
                warn!(
                    key = %key,
                    count,
                    limit = limit.limit(),
                    block_ms = duration_ms(block),
                    "Rate limit exceeded, blocking key"
                );
                self.sink.emit(
                    AuditEvent::new(AuditKind::KeyBlocked, Severity::Warning, key.as_str())
                        .with("count", count)
                        .with("threshold", limit.limit())
                        .with("block_ms", duration_ms(block)),
                );
                false
            }
        }
    }

    /// Whether `key` is currently blocked.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.records
            .get(key)
            .is_some_and(|record| record.is_blocked(now))
    }

    /// Time left on the block for `key`, zero when not blocked.
    pub fn remaining_block_time(&self, key: &str) -> Duration {
        let now = self.clock.now();
        self.records
            .get(key)
            .map(|record| record.remaining_block(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Snapshot of the record for `key`, if one exists.
    pub fn metrics_for(&self, key: &str) -> Option<TrafficSnapshot> {
        let now = self.clock.now();
        self.records.get(key).map(|record| record.snapshot(key, now))
    }

    /// Remove the record for `key`. Returns whether one existed.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.records.remove(key).is_some();
        if removed {
            debug!(key = %key, "Traffic record reset");
        }
        removed
    }

    /// Drop every record whose window has elapsed and whose block has lapsed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_stale(now));
        let removed = before.saturating_sub(self.records.len());
        self.eviction_queue
            .lock()
            .retain(|key| self.records.contains_key(key));
        if removed > 0 {
            debug!(removed, remaining = self.records.len(), "Swept stale traffic records");
        }
        removed
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.records.len()
    }

    /// Clear all records.
    pub fn clear(&self) {
        let mut queue = self.eviction_queue.lock();
        queue.clear();
        self.records.clear();
    }

    /// Scale the configured threshold to the limit in force, so the same
    /// fraction of the limit marks a caller as suspicious.
    fn suspicion_threshold(&self, limit: &Limit) -> u64 {
        let configured = u128::from(self.config.suspicion_threshold);
        let max = u128::from(self.config.max_requests_per_window);
        let scaled = configured * u128::from(limit.limit()) / max;
        u64::try_from(scaled).unwrap_or(u64::MAX).max(1)
    }

    /// Evict one record when a new key would exceed the cap.
    ///
    /// Second-chance approximation of least recently used: keys cycle through
    /// the eviction queue, a key checked since its last pass gets one more
    /// lap, and a live-blocked record is never evicted. The scan is bounded;
    /// when it finds no candidate the new key is admitted over the cap and
    /// the sweep reclaims space once blocks lapse.
    fn make_room(&self, key: &str) {
        if self.records.len() < self.config.max_tracked_keys || self.records.contains_key(key) {
            return;
        }
        let now = self.clock.now();
        let mut queue = self.eviction_queue.lock();
        let budget = EVICTION_SCAN_LIMIT.min(queue.len() * 2);

        for _ in 0..budget {
            let Some(candidate) = queue.pop_front() else {
                break;
            };
            let evictable = match self.records.get_mut(&candidate) {
                // Reset or swept since it was queued
                None => continue,
                Some(mut record) => !record.take_reference() && !record.is_blocked(now),
            };
            if evictable
                && self
                    .records
                    .remove_if(&candidate, |_, record| !record.is_blocked(now))
                    .is_some()
            {
                debug!(evicted = %candidate, "Evicted traffic record at capacity");
                return;
            }
            queue.push_back(candidate);
        }

        debug!(
            key = %key,
            tracked = self.records.len(),
            cap = self.config.max_tracked_keys,
            "No evictable traffic record, admitting over capacity"
        );
    }

    fn flag_suspicious(&self, key: &TrafficKey, count: u64, threshold: u64) {
        warn!(key = %key, count, threshold, "Suspicious request volume");
        self.sink.emit(
            AuditEvent::new(AuditKind::SuspiciousActivity, Severity::Warning, key.as_str())
                .with("count", count)
                .with("threshold", threshold),
        );
    }
}

impl PeriodicCheck for RateLimiter {
    fn name(&self) -> &str {
        "traffic_sweep"
    }

    fn run(&self) {
        self.sweep();
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    fn config() -> RateLimitingConfig {
        RateLimitingConfig {
            max_requests_per_window: 10,
            window_duration_ms: 60_000,
            suspicion_threshold: 8,
            block_duration_ms: 60_000,
            max_tracked_keys: 100,
            sweep_interval_ms: 60_000,
        }
    }

    fn limiter_with(config: RateLimitingConfig) -> (RateLimiter, ManualClock, MemorySink) {
        let clock = ManualClock::starting_now();
        let sink = MemorySink::new();
        let limiter =
            RateLimiter::new(config, Arc::new(clock.clone()), Arc::new(sink.clone())).unwrap();
        (limiter, clock, sink)
    }

    fn limiter() -> (RateLimiter, ManualClock, MemorySink) {
        limiter_with(config())
    }

    fn key(raw: &str) -> TrafficKey {
        TrafficKey::new(raw).unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let (limiter, _, _) = limiter();
        assert_eq!(limiter.tracked_keys(), 0);
        assert_eq!(limiter.default_limit().limit(), 10);
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let mut bad = config();
        bad.block_duration_ms = 0;
        let result = RateLimiter::new(
            bad,
            Arc::new(ManualClock::starting_now()),
            Arc::new(MemorySink::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_check_rate_limit_validates_arguments() {
        let (limiter, _, _) = limiter();
        assert!(limiter.check_rate_limit("", 5, MINUTE).is_err());
        assert!(limiter.check_rate_limit("k", 0, MINUTE).is_err());
        assert!(limiter.check_rate_limit("k", 5, Duration::ZERO).is_err());
        assert!(limiter.check_rate_limit("k", 5, MINUTE).unwrap());
    }

    #[test]
    fn test_check_creates_record_and_increments() {
        let (limiter, _, _) = limiter();
        let limit = Limit::new(5, MINUTE).unwrap();

        assert!(limiter.check(&key("user:1:login"), &limit));
        assert!(limiter.check(&key("user:1:login"), &limit));

        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.metrics_for("user:1:login").unwrap().count, 2);
    }

    #[test]
    fn test_limit_plus_one_denied_and_blocked() {
        let (limiter, _, sink) = limiter();
        let limit = Limit::new(5, MINUTE).unwrap();
        let k = key("ip:10.0.0.1:login");

        for _ in 0..5 {
            assert!(limiter.check(&k, &limit));
        }
        assert!(!limiter.check(&k, &limit));
        assert!(limiter.is_blocked(k.as_str()));
        assert_eq!(limiter.remaining_block_time(k.as_str()), MINUTE);

        let blocked = sink.of_kind(AuditKind::KeyBlocked);
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].detail_u64("count"), Some(6));
        assert_eq!(blocked[0].detail_u64("threshold"), Some(5));
    }

    #[test]
    fn test_denied_while_blocked_emits_and_keeps_count() {
        let (limiter, clock, sink) = limiter();
        let limit = Limit::new(1, MINUTE).unwrap();
        let k = key("user:2:export");

        limiter.check(&k, &limit);
        limiter.check(&k, &limit);
        clock.advance(Duration::from_secs(10));
        assert!(!limiter.check(&k, &limit));

        assert_eq!(limiter.metrics_for(k.as_str()).unwrap().count, 2);
        let denied = sink.of_kind(AuditKind::RequestDenied);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].detail_u64("retry_after_ms"), Some(50_000));
    }

    #[test]
    fn test_block_expires_without_reset() {
        let (limiter, clock, _) = limiter();
        let limit = Limit::new(1, MINUTE).unwrap();
        let k = key("user:3:login");

        limiter.check(&k, &limit);
        limiter.check(&k, &limit);

        clock.advance(Duration::from_secs(59));
        assert!(limiter.is_blocked(k.as_str()));
        clock.advance(Duration::from_secs(1));
        assert!(!limiter.is_blocked(k.as_str()));
        assert_eq!(limiter.remaining_block_time(k.as_str()), Duration::ZERO);
    }

    #[test]
    fn test_suspicion_scaled_to_limit() {
        let (limiter, _, sink) = limiter();
        // 8 of 10 configured, so a limit of 5 flags above 4
        let limit = Limit::new(5, MINUTE).unwrap();
        let k = key("user:4:search");

        for _ in 0..4 {
            limiter.check(&k, &limit);
        }
        assert_eq!(sink.count(AuditKind::SuspiciousActivity), 0);

        assert!(limiter.check(&k, &limit));
        assert!(limiter.metrics_for(k.as_str()).unwrap().suspicious);
        let flagged = sink.of_kind(AuditKind::SuspiciousActivity);
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].detail_u64("count"), Some(5));
        assert_eq!(flagged[0].detail_u64("threshold"), Some(4));
    }

    #[test]
    fn test_default_limit_uses_configured_threshold() {
        let (limiter, _, sink) = limiter();
        let k = key("global:signup");
        for _ in 0..9 {
            assert!(limiter.check_default(&k));
        }
        assert_eq!(sink.count(AuditKind::SuspiciousActivity), 1);
        assert!(limiter.check_default(&k));
        assert!(!limiter.check_default(&k));
    }

    #[test]
    fn test_reset_is_idempotent() {
        let (limiter, _, _) = limiter();
        let limit = Limit::new(1, MINUTE).unwrap();
        let k = key("user:5:login");
        limiter.check(&k, &limit);
        limiter.check(&k, &limit);
        assert!(limiter.is_blocked(k.as_str()));

        assert!(limiter.reset(k.as_str()));
        assert!(!limiter.reset(k.as_str()));
        assert!(limiter.metrics_for(k.as_str()).is_none());
        assert!(!limiter.is_blocked(k.as_str()));

        assert!(limiter.check(&k, &limit));
        assert_eq!(limiter.metrics_for(k.as_str()).unwrap().count, 1);
    }

    #[test]
    fn test_different_keys_have_separate_records() {
        let (limiter, _, _) = limiter();
        let limit = Limit::new(1, MINUTE).unwrap();
        assert!(limiter.check(&key("user:a:x"), &limit));
        assert!(limiter.check(&key("user:b:x"), &limit));
        assert!(!limiter.check(&key("user:a:x"), &limit));
        assert!(!limiter.is_blocked("user:b:x"));
    }

    #[test]
    fn test_sweep_removes_only_stale_records() {
        let (limiter, clock, _) = limiter();
        let limit = Limit::new(1, MINUTE).unwrap();
        limiter.check(&key("quiet"), &limit);
        limiter.check(&key("noisy"), &limit);
        limiter.check(&key("noisy"), &limit);

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.sweep(), 0);

        clock.advance(Duration::from_secs(31));
        limiter.run();
        assert!(limiter.metrics_for("quiet").is_none());
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_capacity_evicts_least_recently_seen() {
        let mut cfg = config();
        cfg.max_tracked_keys = 2;
        let (limiter, clock, _) = limiter_with(cfg);
        let limit = Limit::new(5, MINUTE).unwrap();

        limiter.check(&key("a"), &limit);
        clock.advance(Duration::from_secs(1));
        limiter.check(&key("b"), &limit);
        clock.advance(Duration::from_secs(1));
        limiter.check(&key("a"), &limit);
        clock.advance(Duration::from_secs(1));
        limiter.check(&key("c"), &limit);

        assert_eq!(limiter.tracked_keys(), 2);
        assert!(limiter.metrics_for("b").is_none());
        assert!(limiter.metrics_for("a").is_some());
        assert!(limiter.metrics_for("c").is_some());
    }

    #[test]
    fn test_capacity_keeps_blocked_records() {
        let mut cfg = config();
        cfg.max_tracked_keys = 2;
        let (limiter, clock, _) = limiter_with(cfg);
        let one = Limit::new(1, MINUTE).unwrap();

        limiter.check(&key("abuser"), &one);
        limiter.check(&key("abuser"), &one);
        clock.advance(Duration::from_secs(1));
        limiter.check(&key("normal"), &one);
        clock.advance(Duration::from_secs(1));
        limiter.check(&key("newcomer"), &one);

        assert!(limiter.is_blocked("abuser"));
        assert!(limiter.metrics_for("normal").is_none());
    }

    #[test]
    fn test_capacity_never_lifts_a_block() {
        let mut cfg = config();
        cfg.max_tracked_keys = 2;
        let (limiter, _, _) = limiter_with(cfg);
        let one = Limit::new(1, MINUTE).unwrap();

        for name in ["a", "b"] {
            limiter.check(&key(name), &one);
            limiter.check(&key(name), &one);
            assert!(limiter.is_blocked(name));
        }

        assert!(limiter.check(&key("c"), &one));

        assert_eq!(limiter.tracked_keys(), 3);
        assert!(limiter.is_blocked("a"));
        assert!(limiter.is_blocked("b"));
        assert!(!limiter.check(&key("a"), &one));
        assert!(!limiter.check(&key("b"), &one));
    }

    #[test]
    fn test_capacity_reclaimed_after_blocks_lapse() {
        let mut cfg = config();
        cfg.max_tracked_keys = 2;
        let (limiter, clock, _) = limiter_with(cfg);
        let one = Limit::new(1, MINUTE).unwrap();

        for name in ["a", "b"] {
            limiter.check(&key(name), &one);
            limiter.check(&key(name), &one);
        }
        limiter.check(&key("c"), &one);
        assert_eq!(limiter.tracked_keys(), 3);

        clock.advance(Duration::from_secs(61));
        limiter.check(&key("d"), &one);

        assert_eq!(limiter.tracked_keys(), 3);
        assert!(limiter.metrics_for("a").is_none());
        assert!(limiter.metrics_for("d").is_some());
    }

    #[test]
    fn test_capacity_eviction_after_reset_skips_missing_keys() {
        let mut cfg = config();
        cfg.max_tracked_keys = 2;
        let (limiter, _, _) = limiter_with(cfg);
        let limit = Limit::new(5, MINUTE).unwrap();

        limiter.check(&key("a"), &limit);
        limiter.check(&key("b"), &limit);
        limiter.reset("a");
        limiter.check(&key("c"), &limit);
        limiter.check(&key("d"), &limit);

        assert_eq!(limiter.tracked_keys(), 2);
        assert!(limiter.metrics_for("b").is_none());
        assert!(limiter.metrics_for("c").is_some());
        assert!(limiter.metrics_for("d").is_some());
    }

    /// Sink that reads the limiter's state back for every event it receives.
    #[derive(Debug, Default)]
    struct ReadBackSink {
        limiter: parking_lot::Mutex<Option<std::sync::Weak<RateLimiter>>>,
        seen: parking_lot::Mutex<Vec<(AuditKind, bool)>>,
    }

    impl crate::audit::AuditSink for ReadBackSink {
        fn emit(&self, event: AuditEvent) {
            let limiter = self.limiter.lock().as_ref().and_then(std::sync::Weak::upgrade);
            if let Some(limiter) = limiter {
                let blocked = limiter.is_blocked(&event.subject);
                self.seen.lock().push((event.event_kind, blocked));
            }
        }
    }

    #[test]
    fn test_sink_may_read_limiter_state() {
        let sink = Arc::new(ReadBackSink::default());
        let limiter = Arc::new(
            RateLimiter::new(
                config(),
                Arc::new(ManualClock::starting_now()),
                sink.clone(),
            )
            .unwrap(),
        );
        *sink.limiter.lock() = Some(Arc::downgrade(&limiter));
        let one = Limit::new(1, MINUTE).unwrap();
        let k = key("user:6:login");

        limiter.check(&k, &one);
        limiter.check(&k, &one);
        limiter.check(&k, &one);

        assert_eq!(
            *sink.seen.lock(),
            vec![
                (AuditKind::SuspiciousActivity, true),
                (AuditKind::KeyBlocked, true),
                (AuditKind::RequestDenied, true),
            ]
        );
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let (limiter, _, _) = limiter();
        let limiter = Arc::new(limiter);
        let limit = Limit::new(50, MINUTE).unwrap();
        let k = key("global:hot");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let k = k.clone();
                std::thread::spawn(move || (0..20).filter(|_| limiter.check(&k, &limit)).count())
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(allowed, 50);
    }
}
