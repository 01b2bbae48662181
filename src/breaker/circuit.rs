//! Circuit breaker around an unreliable downstream dependency.
//!
//! Closed passes calls through, Open rejects them without invoking the
//! operation, HalfOpen lets exactly one trial call through. All transitions
//! happen under one lock per breaker, so concurrent callers can never both
//! become the HalfOpen trial.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditKind, Severity, SharedSink};
use crate::clock::SharedClock;
use crate::config::CircuitBreakerConfig;
use crate::error::{retry_secs, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected immediately
    Open,
    /// One trial call is permitted
    HalfOpen,
}

impl CircuitState {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure surfaced by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call; the operation was never invoked
    #[error("{resource} is temporarily unavailable, retry in {} seconds", retry_secs(.retry_after))]
    Open {
        /// Resource class guarded by the breaker
        resource: String,
        /// Time until a trial call may be attempted
        retry_after: Duration,
    },

    /// The operation itself failed; the error is passed through untouched
    #[error("{0}")]
    Operation(E),
}

impl<E> BreakerError<E> {
    /// Whether the breaker rejected the call without running it.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// The operation's own error, if the operation ran and failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            BreakerError::Operation(err) => Some(err),
            BreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Resource class
    pub resource: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures since the last reset to Closed
    pub failure_count: u32,
    /// Time since the last recorded failure
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

enum Transition {
    Opened { failure_count: u32, trial: bool },
    Closed,
}

/// Three-state circuit breaker for one resource class.
#[derive(Debug)]
pub struct CircuitBreaker {
    resource: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
    clock: SharedClock,
    sink: SharedSink,
}

impl CircuitBreaker {
    /// Create a closed breaker, validating its configuration eagerly.
    pub fn new(
        resource: impl Into<String>,
        config: &CircuitBreakerConfig,
        clock: SharedClock,
        sink: SharedSink,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            resource: resource.into(),
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
            clock,
            sink,
        })
    }

    /// Resource class this breaker guards.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Get the current circuit state.
    ///
    /// An Open breaker whose recovery timeout has elapsed still reports Open
    /// until a call is attempted.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the number of consecutive failures.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Point-in-time view for metrics and administration.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let inner = self.inner.lock();
        BreakerSnapshot {
            resource: self.resource.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            since_last_failure: inner
                .last_failure
                .map(|at| now.saturating_duration_since(at)),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// When Open, fails fast with [`BreakerError::Open`] without invoking the
    /// operation. Otherwise the operation runs exactly once and its error, if
    /// any, is returned unmodified inside [`BreakerError::Operation`].
    /// Dropping the returned future mid-flight counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let permit = self.admit().map_err(|retry_after| BreakerError::Open {
            resource: self.resource.clone(),
            retry_after,
        })?;

        match operation().await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(BreakerError::Operation(err))
            }
        }
    }

    /// Force the breaker back to Closed. Administrative; always audited.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            inner.trial_in_flight = false;
        }
        info!(resource = %self.resource, "Circuit breaker reset by administrator");
        self.sink.emit(
            AuditEvent::new(AuditKind::BreakerClosed, Severity::Info, self.resource.as_str())
                .with("reason", "admin_reset"),
        );
    }

    /// Decide whether a call may run, returning the wait time when it may not.
    fn admit(&self) -> std::result::Result<CallPermit<'_>, Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let since_failure = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);

                if since_failure > self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(resource = %self.resource, "Circuit breaker half-open, admitting trial call");
                    Ok(CallPermit::new(self, true))
                } else {
                    debug!(resource = %self.resource, "Circuit open, rejecting call");
                    Err(self.recovery_timeout.saturating_sub(since_failure))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    debug!(resource = %self.resource, "Trial call in flight, rejecting call");
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit::new(self, true))
                }
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            if trial && inner.state == CircuitState::HalfOpen {
                inner.trial_in_flight = false;
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                Some(Transition::Closed)
            } else {
                if inner.state != CircuitState::Open {
                    inner.failure_count = 0;
                }
                None
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn record_failure(&self, trial: bool) {
        let now = self.clock.now();
        let transition = {
            let mut inner = self.inner.lock();
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure = Some(now);

            match inner.state {
                CircuitState::HalfOpen if trial => {
                    inner.trial_in_flight = false;
                    inner.state = CircuitState::Open;
                    Some(Transition::Opened {
                        failure_count: inner.failure_count,
                        trial: true,
                    })
                }
                CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                    inner.state = CircuitState::Open;
                    Some(Transition::Opened {
                        failure_count: inner.failure_count,
                        trial: false,
                    })
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.announce(transition);
        }
    }

    fn announce(&self, transition: Transition) {
        match transition {
            Transition::Opened {
                failure_count,
                trial,
            } => {
                warn!(
                    resource = %self.resource,
                    failure_count,
                    threshold = self.failure_threshold,
                    trial,
                    "Circuit breaker opened"
                );
                self.sink.emit(
                    AuditEvent::new(AuditKind::BreakerOpened, Severity::Warning, self.resource.as_str())
                        .with("failure_count", failure_count)
                        .with("threshold", self.failure_threshold)
                        .with("trial_failed", trial)
                        .with("recovery_timeout_ms", u64::try_from(self.recovery_timeout.as_millis()).unwrap_or(u64::MAX)),
                );
            }
            Transition::Closed => {
                info!(resource = %self.resource, "Circuit breaker closed after successful trial");
                self.sink.emit(
                    AuditEvent::new(AuditKind::BreakerClosed, Severity::Info, self.resource.as_str())
                        .with("reason", "trial_succeeded"),
                );
            }
        }
    }
}

/// Admission for one call. Settles the breaker exactly once; a permit
/// dropped unsettled (the caller went away) records a failure.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!(resource = %self.breaker.resource, trial = self.trial, "Call cancelled in flight, counting as failure");
            self.breaker.record_failure(self.trial);
        }
    }
}
