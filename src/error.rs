//! Error types for the Warden governance layer.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Invalid limits, timeouts or other settings, raised at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// A call argument violated its contract (empty key, zero limit)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session fingerprint no longer matches; the session is gone
    #[error("Session integrity violation: {reason}")]
    SessionIntegrityViolation {
        /// Why the session was torn down
        reason: String,
    },

    /// The session sat idle longer than the configured timeout
    #[error("Session expired after {}s of inactivity", .idle.as_secs())]
    SessionExpired {
        /// How long the session had been idle when it was checked
        idle: Duration,
    },

    /// Configuration source errors (file + environment layering)
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Render a retry hint in whole seconds, rounded up and never below one.
pub(crate) fn retry_secs(wait: &Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}
