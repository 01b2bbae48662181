//! Errors surfaced by guarded calls.

use std::time::Duration;
use thiserror::Error;

use crate::error::{retry_secs, WardenError};

/// Failure of a guarded call.
///
/// Governance failures carry only a kind and a retry hint; the operation's
/// own error passes through unmodified.
#[derive(Debug, Error)]
pub enum GuardError<E> {
    /// The session was torn down; every call fails until the next sign-in
    #[error("Session has ended, sign in again")]
    SessionTerminated,

    /// The caller is blocked by the rate limiter
    #[error("temporarily unavailable, retry in {} seconds", retry_secs(.retry_after))]
    RateLimited {
        /// Remaining block time
        retry_after: Duration,
    },

    /// The breaker for the operation's resource class is open
    #[error("temporarily unavailable, retry in {} seconds", retry_secs(.retry_after))]
    Unavailable {
        /// Resource class of the open breaker
        resource: String,
        /// Time until a trial call may be attempted
        retry_after: Duration,
    },

    /// The caller identifier or operation key was malformed
    #[error("Invalid request: {0}")]
    Invalid(WardenError),

    /// The operation ran and failed
    #[error("{0}")]
    Operation(E),
}

impl<E> GuardError<E> {
    /// Stable snake_case tag for audit records and UX.
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::SessionTerminated => "session_terminated",
            GuardError::RateLimited { .. } => "rate_limited",
            GuardError::Unavailable { .. } => "unavailable",
            GuardError::Invalid(_) => "invalid_request",
            GuardError::Operation(_) => "operation_failed",
        }
    }

    /// How long to wait before retrying, for governance rejections.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardError::RateLimited { retry_after } | GuardError::Unavailable { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// Whether the operation was never invoked.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, GuardError::Operation(_))
    }

    /// The operation's own error, if it ran and failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            GuardError::Operation(err) => Some(err),
            _ => None,
        }
    }
}
