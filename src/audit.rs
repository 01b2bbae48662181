//! Security audit events and the sinks that receive them.
//!
//! Every deny, block, suspicious-activity flag, breaker transition and
//! session teardown produces exactly one [`AuditEvent`]. Emission never
//! blocks the caller and never fails it; a sink that cannot keep up drops
//! events and logs that it did.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Kind of governance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A request was denied by the rate limiter
    RequestDenied,
    /// A key exceeded its limit and was blocked
    KeyBlocked,
    /// A key crossed the suspicion threshold within its window
    SuspiciousActivity,
    /// A breaker opened
    BreakerOpened,
    /// A breaker closed again after a successful trial or an admin reset
    BreakerClosed,
    /// The session fingerprint changed
    IntegrityViolation,
    /// The session sat idle past its timeout
    IdleTimeout,
    /// The session was torn down
    SessionTerminated,
    /// A guarded call failed
    GuardFailure,
}

impl AuditKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::RequestDenied => "request_denied",
            AuditKind::KeyBlocked => "key_blocked",
            AuditKind::SuspiciousActivity => "suspicious_activity",
            AuditKind::BreakerOpened => "breaker_opened",
            AuditKind::BreakerClosed => "breaker_closed",
            AuditKind::IntegrityViolation => "integrity_violation",
            AuditKind::IdleTimeout => "idle_timeout",
            AuditKind::SessionTerminated => "session_terminated",
            AuditKind::GuardFailure => "guard_failure",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgently downstream monitoring should look at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine state change
    Info,
    /// Abuse signal or degraded dependency
    Warning,
    /// Session takeover or other fatal security condition
    Critical,
}

/// One structured governance event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// What happened
    pub event_kind: AuditKind,
    /// Traffic key, breaker resource or session the event is about
    pub subject: String,
    /// Session the event belongs to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Urgency
    pub severity: Severity,
    /// Wall-clock time of emission
    pub timestamp: DateTime<Utc>,
    /// Event-specific fields
    #[serde(default)]
    pub detail: Map<String, Value>,
}

impl AuditEvent {
    /// Create an event stamped with the current wall-clock time.
    pub fn new(event_kind: AuditKind, severity: Severity, subject: impl Into<String>) -> Self {
        Self {
            event_kind,
            subject: subject.into(),
            session_id: None,
            severity,
            timestamp: Utc::now(),
            detail: Map::new(),
        }
    }

    /// Attach a detail field.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.detail.insert(field.to_string(), value.into());
        self
    }

    /// Attach the session this event belongs to.
    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Look up a detail field.
    pub fn detail_u64(&self, field: &str) -> Option<u64> {
        self.detail.get(field).and_then(Value::as_u64)
    }
}

/// Receiver of governance events.
///
/// Implementations must return quickly; `emit` runs on the caller's path
/// after the decision it reports has been applied.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Deliver one event.
    fn emit(&self, event: AuditEvent);
}

/// Shareable sink reference.
pub type SharedSink = Arc<dyn AuditSink>;

/// Sink that writes each event as a structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    /// Create a shareable tracing sink.
    pub fn shared() -> SharedSink {
        Arc::new(Self)
    }
}

impl AuditSink for TracingSink {
    fn emit(&self, event: AuditEvent) {
        let detail = Value::Object(event.detail.clone());
        let session = event.session_id.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info => info!(
                target: "warden::audit",
                event_kind = %event.event_kind,
                subject = %event.subject,
                session_id = %session,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %detail,
                "governance event"
            ),
            Severity::Warning => warn!(
                target: "warden::audit",
                event_kind = %event.event_kind,
                subject = %event.subject,
                session_id = %session,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %detail,
                "governance event"
            ),
            Severity::Critical => error!(
                target: "warden::audit",
                event_kind = %event.event_kind,
                subject = %event.subject,
                session_id = %session,
                timestamp = %event.timestamp.to_rfc3339(),
                detail = %detail,
                "security event"
            ),
        }
    }
}

/// Sink that keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemorySink {
    /// Create an empty memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event received so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one kind.
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_kind == kind)
            .cloned()
            .collect()
    }

    /// Number of events of one kind.
    pub fn count(&self, kind: AuditKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_kind == kind)
            .count()
    }

    /// Drop every collected event.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Sink that hands events to an external pipeline over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver the pipeline drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelSink {
    fn emit(&self, event: AuditEvent) {
        if let Err(err) = self.tx.send(event) {
            warn!(
                event_kind = %err.0.event_kind,
                subject = %err.0.subject,
                "Audit pipeline closed, dropping event"
            );
        }
    }
}

/// Sink that forwards every event to several sinks.
#[derive(Debug, Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    /// Create a fan-out over the given sinks.
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutSink {
    fn emit(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
