//! Warden - Traffic Governance and Session Integrity
//!
//! This crate guards calls into unreliable or abuse-prone operations. A
//! [`GuardedCallDispatcher`] consults a fixed-window [`RateLimiter`] before
//! admitting a call and runs it through the [`CircuitBreaker`] for the
//! operation's resource class. A [`SessionIntegrityMonitor`] watches the
//! session's environment fingerprint and idle time, and can veto every
//! further call by terminating the session.
//!
//! All state is in memory for the life of the process. Every deny, block,
//! breaker transition and session teardown is reported to an injected
//! [`AuditSink`].

pub mod audit;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ratelimit;
pub mod scheduler;
pub mod session;

pub use audit::{AuditEvent, AuditKind, AuditSink, Severity};
pub use breaker::{BreakerError, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WardenConfig;
pub use dispatch::{GuardError, GuardedCallDispatcher};
pub use error::{Result, WardenError};
pub use ratelimit::{CallerId, Limit, RateLimiter, TrafficKey};
pub use session::SessionIntegrityMonitor;
