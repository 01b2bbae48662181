//! Session integrity and idle-timeout enforcement.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditKind, Severity, SharedSink};
use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::error::{Result, WardenError};
use crate::scheduler::PeriodicCheck;

use super::activity::ActivityClock;
use super::fingerprint::{EnvironmentProbe, FingerprintStrategy, Sha256Fingerprint};
use super::store::SessionStore;

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The environment fingerprint changed mid-session
    IntegrityViolation,
    /// No activity within the idle timeout
    IdleTimeout,
    /// The user signed out
    SignedOut,
}

impl TerminationReason {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::IntegrityViolation => "integrity_violation",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::SignedOut => "signed_out",
        }
    }

    fn is_security_event(&self) -> bool {
        !matches!(self, TerminationReason::SignedOut)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback run on teardown, e.g. to invalidate cached credentials.
pub type TeardownHook = Box<dyn Fn(TerminationReason) + Send + Sync>;

#[derive(Debug)]
struct SessionState {
    session_id: String,
    activity: ActivityClock,
    terminated: Option<TerminationReason>,
}

/// Watches one session for fingerprint tampering and idleness.
///
/// Any failure is fatal to the session: the session store is cleared,
/// teardown hooks run, and the failure is reported as a security event.
/// A terminated session stays terminated until the next [`sign_in`](Self::sign_in).
pub struct SessionIntegrityMonitor {
    config: SessionConfig,
    probe: Arc<dyn EnvironmentProbe>,
    strategy: Arc<dyn FingerprintStrategy>,
    store: Arc<dyn SessionStore>,
    clock: SharedClock,
    sink: SharedSink,
    state: Mutex<SessionState>,
    hooks: RwLock<Vec<TeardownHook>>,
}

impl fmt::Debug for SessionIntegrityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIntegrityMonitor")
            .field("config", &self.config)
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

impl SessionIntegrityMonitor {
    /// Create a monitor for a freshly started session.
    pub fn new(
        config: SessionConfig,
        probe: Arc<dyn EnvironmentProbe>,
        store: Arc<dyn SessionStore>,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;
        let activity = ActivityClock::new(
            clock.now(),
            config.idle_timeout(),
            config.activity_debounce(),
        );
        Ok(Self {
            config,
            probe,
            strategy: Arc::new(Sha256Fingerprint),
            store,
            clock,
            sink,
            state: Mutex::new(SessionState {
                session_id: Uuid::new_v4().to_string(),
                activity,
                terminated: None,
            }),
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Replace the fingerprint strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn FingerprintStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Register a callback to run on teardown.
    pub fn on_teardown(&self, hook: impl Fn(TerminationReason) + Send + Sync + 'static) {
        self.hooks.write().push(Box::new(hook));
    }

    /// Identifier of the current session.
    pub fn session_id(&self) -> String {
        self.state.lock().session_id.clone()
    }

    /// Cadence of background checks.
    pub fn check_interval(&self) -> Duration {
        self.config.activity_check_interval()
    }

    /// Whether the session has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated.is_some()
    }

    /// Why the session was torn down, if it was.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.state.lock().terminated
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let now = self.clock.now();
        self.state.lock().activity.idle_for(now)
    }

    /// Start a new session: fresh id, activity clock restarted, session
    /// storage cleared and the current fingerprint captured.
    pub fn sign_in(&self) -> String {
        let fingerprint = self.strategy.derive(&self.probe.snapshot());
        let now = self.clock.now();
        let session_id = {
            let mut state = self.state.lock();
            state.session_id = Uuid::new_v4().to_string();
            state.activity.restart(now);
            state.terminated = None;
            self.store.clear();
            self.store.store_fingerprint(fingerprint);
            state.session_id.clone()
        };
        info!(session_id = %session_id, "Session started");
        session_id
    }

    /// End the session at the user's request.
    pub fn sign_out(&self) {
        self.terminate(TerminationReason::SignedOut);
    }

    /// Compare the current fingerprint with the one captured for the session.
    ///
    /// The first check of a session captures the fingerprint and succeeds.
    /// A mismatch tears the session down.
    ///
    /// The environment is read before the session lock is taken, so a probe
    /// may call back into the monitor. The store is only read or written
    /// under the lock, after the termination check.
    pub fn validate_integrity(&self) -> bool {
        let computed = self.strategy.derive(&self.probe.snapshot());

        let session_id = {
            let mut state = self.state.lock();
            if state.terminated.is_some() {
                return false;
            }
            match self.store.fingerprint() {
                None => {
                    debug!(session_id = %state.session_id, "Captured session fingerprint");
                    self.store.store_fingerprint(computed);
                    return true;
                }
                Some(stored) if stored == computed => return true,
                Some(_) => {
                    match self.begin_teardown(&mut state, TerminationReason::IntegrityViolation) {
                        Some(session_id) => session_id,
                        None => return false,
                    }
                }
            }
        };

        error!(session_id = %session_id, "Session fingerprint mismatch");
        self.sink.emit(
            AuditEvent::new(AuditKind::IntegrityViolation, Severity::Critical, "session")
                .in_session(session_id.clone())
                .with("check", "fingerprint"),
        );
        self.finish_teardown(TerminationReason::IntegrityViolation, session_id);
        false
    }

    /// Note a user interaction. Signals inside the debounce window collapse
    /// into the previous update. Returns whether the clock advanced.
    pub fn record_activity(&self) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.terminated.is_some() {
            return false;
        }
        state.activity.record(now)
    }

    /// Whether the session is still within its idle allowance. Tears the
    /// session down when it is not.
    pub fn check_idle_timeout(&self) -> bool {
        let now = self.clock.now();
        let (idle, session_id) = {
            let mut state = self.state.lock();
            if state.terminated.is_some() {
                return false;
            }
            if state.activity.is_within_timeout(now) {
                return true;
            }
            let idle = state.activity.idle_for(now);
            match self.begin_teardown(&mut state, TerminationReason::IdleTimeout) {
                Some(session_id) => (idle, session_id),
                None => return false,
            }
        };

        warn!(session_id = %session_id, idle_secs = idle.as_secs(), "Session idle timeout");
        self.sink.emit(
            AuditEvent::new(AuditKind::IdleTimeout, Severity::Warning, "session")
                .in_session(session_id.clone())
                .with("idle_ms", duration_ms(idle))
                .with("timeout_ms", self.config.idle_timeout_ms),
        );
        self.finish_teardown(TerminationReason::IdleTimeout, session_id);
        false
    }

    /// On-demand check before a sensitive operation.
    pub fn ensure_active(&self) -> Result<()> {
        if let Some(reason) = self.termination_reason() {
            return Err(self.termination_error(reason));
        }
        if !self.validate_integrity() {
            return Err(self.termination_error(TerminationReason::IntegrityViolation));
        }
        if !self.check_idle_timeout() {
            return Err(self.termination_error(TerminationReason::IdleTimeout));
        }
        Ok(())
    }

    /// Start-up check: integrity first, then idleness.
    pub fn startup_check(&self) -> bool {
        self.validate_integrity() && self.check_idle_timeout()
    }

    fn termination_error(&self, reason: TerminationReason) -> WardenError {
        match reason {
            TerminationReason::IdleTimeout => WardenError::SessionExpired {
                idle: self.idle_for(),
            },
            other => WardenError::SessionIntegrityViolation {
                reason: other.to_string(),
            },
        }
    }

    fn terminate(&self, reason: TerminationReason) {
        let session_id = {
            let mut state = self.state.lock();
            self.begin_teardown(&mut state, reason)
        };
        if let Some(session_id) = session_id {
            self.finish_teardown(reason, session_id);
        }
    }

    /// Mark the session ended and wipe its storage. Runs under the session
    /// lock so no check can re-capture a fingerprint for an ended session.
    /// Returns the session id, or `None` when it had already ended.
    fn begin_teardown(&self, state: &mut SessionState, reason: TerminationReason) -> Option<String> {
        if state.terminated.is_some() {
            return None;
        }
        state.terminated = Some(reason);
        self.store.clear();
        Some(state.session_id.clone())
    }

    fn finish_teardown(&self, reason: TerminationReason, session_id: String) {
        for hook in self.hooks.read().iter() {
            hook(reason);
        }

        if reason.is_security_event() {
            warn!(session_id = %session_id, reason = %reason, "Session terminated");
            self.sink.emit(
                AuditEvent::new(AuditKind::SessionTerminated, Severity::Critical, "session")
                    .in_session(session_id)
                    .with("reason", reason.as_str()),
            );
        } else {
            info!(session_id = %session_id, "Session signed out");
        }
    }
}

impl PeriodicCheck for SessionIntegrityMonitor {
    fn name(&self) -> &str {
        "session_watch"
    }

    fn run(&self) {
        if self.validate_integrity() {
            self.check_idle_timeout();
        }
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
    use crate::session::{EnvironmentSnapshot, MemorySessionStore, StaticEnvironment};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Fixture {
        monitor: SessionIntegrityMonitor,
        clock: ManualClock,
        sink: MemorySink,
        probe: Arc<StaticEnvironment>,
        store: Arc<MemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let sink = MemorySink::new();
        let probe = Arc::new(StaticEnvironment::new(EnvironmentSnapshot {
            user_agent: "agent/1.0".to_string(),
            locale: "en-GB".to_string(),
            ..EnvironmentSnapshot::default()
        }));
        let store = Arc::new(MemorySessionStore::new());
        let monitor = SessionIntegrityMonitor::new(
            SessionConfig::default(),
            probe.clone(),
            store.clone(),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        )
        .unwrap();
        Fixture {
            monitor,
            clock,
            sink,
            probe,
            store,
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SessionConfig {
            activity_check_interval_ms: 0,
            ..SessionConfig::default()
        };
        let result = SessionIntegrityMonitor::new(
            config,
            Arc::new(StaticEnvironment::default()),
            Arc::new(MemorySessionStore::new()),
            Arc::new(ManualClock::starting_now()),
            Arc::new(MemorySink::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_first_check_bootstraps_fingerprint() {
        let f = fixture();
        assert!(f.store.fingerprint().is_none());
        assert!(f.monitor.validate_integrity());
        assert!(f.store.fingerprint().is_some());
        assert!(f.monitor.validate_integrity());
    }

    #[test]
    fn test_environment_change_terminates() {
        let f = fixture();
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = torn_down.clone();
        f.monitor.on_teardown(move |reason| {
            assert_eq!(reason, TerminationReason::IntegrityViolation);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f.store.put("access_token", "secret");

        assert!(f.monitor.validate_integrity());
        f.probe.update(|e| e.locale = "fr-FR".to_string());
        assert!(!f.monitor.validate_integrity());

        assert!(f.monitor.is_terminated());
        assert!(f.store.is_empty());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.count(AuditKind::IntegrityViolation), 1);
        let terminated = f.sink.of_kind(AuditKind::SessionTerminated);
        assert_eq!(terminated.len(), 1);
        assert_eq!(terminated[0].severity, Severity::Critical);
        assert_eq!(terminated[0].session_id, Some(f.monitor.session_id()));

        // restoring the environment does not revive the session
        f.probe.update(|e| e.locale = "en-GB".to_string());
        assert!(!f.monitor.validate_integrity());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_timeout_boundaries() {
        let f = fixture();
        f.clock.advance(29 * MINUTE);
        assert!(f.monitor.check_idle_timeout());
        f.clock.advance(2 * MINUTE);
        assert!(!f.monitor.check_idle_timeout());
        assert_eq!(
            f.monitor.termination_reason(),
            Some(TerminationReason::IdleTimeout)
        );
        let idle = f.sink.of_kind(AuditKind::IdleTimeout);
        assert_eq!(idle[0].detail_u64("idle_ms"), Some(31 * 60 * 1000));
    }

    #[test]
    fn test_activity_keeps_session_alive() {
        let f = fixture();
        f.clock.advance(20 * MINUTE);
        assert!(f.monitor.record_activity());
        f.clock.advance(20 * MINUTE);
        assert!(f.monitor.check_idle_timeout());
        assert_eq!(f.monitor.idle_for(), 20 * MINUTE);
    }

    #[test]
    fn test_activity_is_debounced() {
        let f = fixture();
        f.clock.advance(Duration::from_secs(5));
        assert!(f.monitor.record_activity());
        assert!(!f.monitor.record_activity());
        f.clock.advance(Duration::from_millis(999));
        assert!(!f.monitor.record_activity());
        f.clock.advance(Duration::from_millis(1));
        assert!(f.monitor.record_activity());
    }

    #[test]
    fn test_sign_out_is_not_a_security_event() {
        let f = fixture();
        f.monitor.validate_integrity();
        f.monitor.sign_out();

        assert_eq!(
            f.monitor.termination_reason(),
            Some(TerminationReason::SignedOut)
        );
        assert!(f.store.is_empty());
        assert!(f.sink.events().is_empty());
        assert!(!f.monitor.record_activity());
    }

    #[test]
    fn test_sign_in_revives_with_new_identity() {
        let f = fixture();
        let first = f.monitor.session_id();
        f.monitor.sign_out();

        f.probe.update(|e| e.locale = "fr-FR".to_string());
        let second = f.monitor.sign_in();

        assert_ne!(first, second);
        assert!(!f.monitor.is_terminated());
        assert!(f.store.fingerprint().is_some());
        assert!(f.monitor.validate_integrity());
    }

    #[test]
    fn test_ensure_active_errors() {
        let f = fixture();
        assert!(f.monitor.ensure_active().is_ok());

        f.clock.advance(31 * MINUTE);
        let err = f.monitor.ensure_active().unwrap_err();
        assert!(matches!(err, WardenError::SessionExpired { .. }));

        let f = fixture();
        f.monitor.validate_integrity();
        f.probe.update(|e| e.user_agent = "other".to_string());
        let err = f.monitor.ensure_active().unwrap_err();
        assert!(matches!(err, WardenError::SessionIntegrityViolation { .. }));
    }

    #[test]
    fn test_periodic_run_checks_both() {
        let f = fixture();
        assert!(f.monitor.startup_check());
        f.clock.advance(31 * MINUTE);
        f.monitor.run();
        assert_eq!(
            f.monitor.termination_reason(),
            Some(TerminationReason::IdleTimeout)
        );
    }

    /// Environment whose every read signs the attached monitor out.
    #[derive(Debug, Default)]
    struct SignOutOnRead {
        monitor: Mutex<Option<Weak<SessionIntegrityMonitor>>>,
    }

    impl EnvironmentProbe for SignOutOnRead {
        fn snapshot(&self) -> EnvironmentSnapshot {
            let monitor = self.monitor.lock().as_ref().and_then(Weak::upgrade);
            if let Some(monitor) = monitor {
                monitor.sign_out();
            }
            EnvironmentSnapshot::default()
        }
    }

    #[test]
    fn test_sign_out_during_check_is_not_undone() {
        let probe = Arc::new(SignOutOnRead::default());
        let store = Arc::new(MemorySessionStore::new());
        let monitor = Arc::new(
            SessionIntegrityMonitor::new(
                SessionConfig::default(),
                probe.clone(),
                store.clone(),
                Arc::new(ManualClock::starting_now()),
                Arc::new(MemorySink::new()),
            )
            .unwrap(),
        );
        *probe.monitor.lock() = Some(Arc::downgrade(&monitor));

        assert!(!monitor.validate_integrity());
        assert!(monitor.is_terminated());
        assert_eq!(
            monitor.termination_reason(),
            Some(TerminationReason::SignedOut)
        );
        assert!(store.fingerprint().is_none());
    }

    #[test]
    fn test_concurrent_teardown_runs_hooks_once() {
        let f = fixture();
        let torn_down = Arc::new(AtomicUsize::new(0));
        let counter = torn_down.clone();
        f.monitor.on_teardown(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        f.monitor.validate_integrity();
        f.probe.update(|e| e.locale = "fr-FR".to_string());
        f.clock.advance(31 * MINUTE);

        let monitor = Arc::new(f.monitor);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let monitor = Arc::clone(&monitor);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        monitor.validate_integrity()
                    } else {
                        monitor.check_idle_timeout()
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }

        assert!(monitor.is_terminated());
        assert!(f.store.fingerprint().is_none());
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert_eq!(f.sink.count(AuditKind::SessionTerminated), 1);
    }

    #[derive(Debug)]
    struct ConstantStrategy;

    impl FingerprintStrategy for ConstantStrategy {
        fn derive(&self, _: &EnvironmentSnapshot) -> crate::session::SessionFingerprint {
            crate::session::SessionFingerprint::new("fixed")
        }
    }

    #[test]
    fn test_strategy_is_pluggable() {
        let f = fixture();
        let monitor = f.monitor.with_strategy(Arc::new(ConstantStrategy));
        assert!(monitor.validate_integrity());
        f.probe.update(|e| e.locale = "fr-FR".to_string());
        assert!(monitor.validate_integrity());
        assert_eq!(f.store.fingerprint().unwrap().as_str(), "fixed");
    }
}
