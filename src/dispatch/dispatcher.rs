//! The guarded-call entry point.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::audit::{AuditEvent, AuditKind, Severity, SharedSink};
use crate::breaker::{BreakerError, BreakerRegistry, BreakerSnapshot, CircuitState};
use crate::clock::SharedClock;
use crate::config::WardenConfig;
use crate::error::Result;
use crate::ratelimit::{CallerId, Limit, RateLimiter, TrafficKey, TrafficSnapshot};
use crate::scheduler::Scheduler;
use crate::session::SessionIntegrityMonitor;

use super::error::GuardError;

/// Composition root for the governance layer.
///
/// Domain code calls [`guard`](Self::guard); the limiter and breakers are
/// reachable only through the administrative methods below, which log or
/// audit every mutation.
#[derive(Debug)]
pub struct GuardedCallDispatcher {
    config: WardenConfig,
    limiter: Arc<RateLimiter>,
    breakers: BreakerRegistry,
    session: Option<Arc<SessionIntegrityMonitor>>,
    clock: SharedClock,
    sink: SharedSink,
}

impl GuardedCallDispatcher {
    /// Build the limiter and breakers from configuration.
    pub fn from_config(config: WardenConfig, clock: SharedClock, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let limiter = RateLimiter::new(
            config.rate_limiting.clone(),
            Arc::clone(&clock),
            Arc::clone(&sink),
        )?;
        let breakers = BreakerRegistry::new(&config.circuit_breaker, Arc::clone(&clock), Arc::clone(&sink))?;
        info!(
            breakers = ?breakers.resources(),
            max_requests = config.rate_limiting.max_requests_per_window,
            "Guarded call dispatcher ready"
        );
        Ok(Self {
            config,
            limiter: Arc::new(limiter),
            breakers,
            session: None,
            clock,
            sink,
        })
    }

    /// Attach a session monitor. Once it terminates the session, every
    /// guarded call fails fast.
    pub fn with_session(mut self, session: Arc<SessionIntegrityMonitor>) -> Self {
        self.session = Some(session);
        self
    }

    /// The attached session monitor, if any.
    pub fn session(&self) -> Option<&Arc<SessionIntegrityMonitor>> {
        self.session.as_ref()
    }

    /// Effective configuration.
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Run `operation` for `caller` under rate limiting and circuit breaking.
    ///
    /// The traffic key is `<caller>:<operation_key>`; the breaker is the one
    /// for the operation key's resource class. A denied or rejected call never
    /// invokes the operation. Every failure is audited with its kind only.
    #[instrument(skip(self, caller, operation, limit), fields(caller = %caller))]
    pub async fn guard<F, Fut, T, E>(
        &self,
        caller: &CallerId,
        operation_key: &str,
        operation: F,
        limit: Limit,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let result = self.dispatch(caller, operation_key, operation, limit).await;
        if let Err(err) = &result {
            self.audit_failure(caller, operation_key, err);
        }
        result
    }

    /// [`guard`](Self::guard) with the configured default limit.
    pub async fn guard_with_defaults<F, Fut, T, E>(
        &self,
        caller: &CallerId,
        operation_key: &str,
        operation: F,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.guard(caller, operation_key, operation, self.limiter.default_limit())
            .await
    }

    async fn dispatch<F, Fut, T, E>(
        &self,
        caller: &CallerId,
        operation_key: &str,
        operation: F,
        limit: Limit,
    ) -> std::result::Result<T, GuardError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if self.session.as_ref().is_some_and(|s| s.is_terminated()) {
            return Err(GuardError::SessionTerminated);
        }

        let key = TrafficKey::compose(caller, operation_key).map_err(GuardError::Invalid)?;
        if !self.limiter.check(&key, &limit) {
            return Err(GuardError::RateLimited {
                retry_after: self.limiter.remaining_block_time(key.as_str()),
            });
        }

        self.breakers
            .for_operation(operation_key)
            .execute(operation)
            .await
            .map_err(|err| match err {
                BreakerError::Open {
                    resource,
                    retry_after,
                } => GuardError::Unavailable {
                    resource,
                    retry_after,
                },
                BreakerError::Operation(err) => GuardError::Operation(err),
            })
    }

    fn audit_failure<E>(&self, caller: &CallerId, operation_key: &str, err: &GuardError<E>) {
        let severity = match err {
            GuardError::SessionTerminated => Severity::Warning,
            _ => Severity::Info,
        };
        debug!(operation = operation_key, kind = err.kind(), "Guarded call failed");

        let mut event = AuditEvent::new(AuditKind::GuardFailure, severity, operation_key)
            .with("caller", caller.to_string())
            .with("kind", err.kind());
        if let Some(wait) = err.retry_after() {
            event = event.with("retry_after_ms", u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
        }
        if let Some(session) = &self.session {
            event = event.in_session(session.session_id());
        }
        self.sink.emit(event);
    }

    /// Count one request for a raw key against an explicit limit.
    pub fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> Result<bool> {
        self.limiter.check_rate_limit(key, limit, window)
    }

    /// Whether `key` is currently blocked.
    pub fn is_blocked(&self, key: &str) -> bool {
        self.limiter.is_blocked(key)
    }

    /// Time left on the block for `key`.
    pub fn remaining_block_time(&self, key: &str) -> Duration {
        self.limiter.remaining_block_time(key)
    }

    /// Snapshot of the traffic record for `key`.
    pub fn metrics_for(&self, key: &str) -> Option<TrafficSnapshot> {
        self.limiter.metrics_for(key)
    }

    /// Drop the traffic record for `key`. Idempotent.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.limiter.reset(key);
        info!(key, removed, "Traffic record reset by administrator");
        removed
    }

    /// State of the breaker guarding `operation_key`.
    pub fn breaker_state(&self, operation_key: &str) -> CircuitState {
        self.breakers.state(operation_key)
    }

    /// Force the breaker guarding `operation_key` back to Closed.
    pub fn reset_breaker(&self, operation_key: &str) {
        self.breakers.for_operation(operation_key).reset();
    }

    /// Snapshots of every breaker.
    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// Validate the attached session's fingerprint. True without a session.
    pub fn validate_session_integrity(&self) -> bool {
        self.session
            .as_ref()
            .map_or(true, |session| session.validate_integrity())
    }

    /// Note user activity on the attached session.
    pub fn record_activity(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.record_activity())
    }

    /// Scheduler with the traffic sweep and, when a session is attached,
    /// the session watch (which also runs on the first pass).
    pub fn scheduler(&self) -> Result<Scheduler> {
        let scheduler = Scheduler::new(Arc::clone(&self.clock), self.config.scheduler.tick())?;
        scheduler.register(
            self.limiter.clone(),
            self.config.rate_limiting.sweep_interval(),
            false,
        )?;
        if let Some(session) = &self.session {
            scheduler.register(session.clone(), session.check_interval(), true)?;
        }
        Ok(scheduler)
    }
}
