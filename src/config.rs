//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, WardenError};

/// Environment variable prefix for layered configuration.
const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for the governance layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Session integrity configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Periodic check scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per fixed window when the caller supplies no limit
    #[serde(default = "default_max_requests")]
    pub max_requests_per_window: u64,

    /// Fixed window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_duration_ms: u64,

    /// Count above which a key is flagged as suspicious
    #[serde(default = "default_suspicion_threshold")]
    pub suspicion_threshold: u64,

    /// How long a key stays blocked after exceeding its limit
    #[serde(default = "default_block_ms")]
    pub block_duration_ms: u64,

    /// Upper bound on tracked keys before least-recently-seen eviction
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,

    /// Interval between stale-record sweeps in milliseconds
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: default_max_requests(),
            window_duration_ms: default_window_ms(),
            suspicion_threshold: default_suspicion_threshold(),
            block_duration_ms: default_block_ms(),
            max_tracked_keys: default_max_tracked_keys(),
            sweep_interval_ms: default_sweep_ms(),
        }
    }
}

fn default_max_requests() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_suspicion_threshold() -> u64 {
    80
}

fn default_block_ms() -> u64 {
    300_000
}

fn default_max_tracked_keys() -> usize {
    10_000
}

fn default_sweep_ms() -> u64 {
    60_000
}

impl RateLimitingConfig {
    /// Fixed window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    /// Block length applied when a key exceeds its limit.
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    /// Interval between stale-record sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject limits and windows that would make the limiter meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests_per_window == 0 {
            return Err(config_error("rate_limiting.max_requests_per_window must be > 0"));
        }
        if self.window_duration_ms == 0 {
            return Err(config_error("rate_limiting.window_duration_ms must be > 0"));
        }
        if self.suspicion_threshold == 0 {
            return Err(config_error("rate_limiting.suspicion_threshold must be > 0"));
        }
        if self.suspicion_threshold >= self.max_requests_per_window {
            return Err(config_error(
                "rate_limiting.suspicion_threshold must be below max_requests_per_window",
            ));
        }
        if self.block_duration_ms == 0 {
            return Err(config_error("rate_limiting.block_duration_ms must be > 0"));
        }
        if self.max_tracked_keys == 0 {
            return Err(config_error("rate_limiting.max_tracked_keys must be > 0"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(config_error("rate_limiting.sweep_interval_ms must be > 0"));
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker waits before permitting a trial call
    #[serde(default = "default_recovery_ms")]
    pub recovery_timeout_ms: u64,

    /// Resource classes that get their own breaker at start-up
    #[serde(default = "default_resources")]
    pub resources: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_ms(),
            resources: default_resources(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_ms() -> u64 {
    30_000
}

fn default_resources() -> Vec<String> {
    vec!["api".to_string(), "auth".to_string()]
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Reject thresholds and timeouts the breaker cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(config_error("circuit_breaker.failure_threshold must be > 0"));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(config_error("circuit_breaker.recovery_timeout_ms must be > 0"));
        }
        if self.resources.iter().any(|r| r.trim().is_empty()) {
            return Err(config_error("circuit_breaker.resources must not contain empty names"));
        }
        Ok(())
    }
}

/// Session integrity configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which the session is torn down
    #[serde(default = "default_idle_ms")]
    pub idle_timeout_ms: u64,

    /// Cadence of the background integrity and idle checks
    #[serde(default = "default_activity_check_ms")]
    pub activity_check_interval_ms: u64,

    /// Activity signals closer together than this collapse into one update
    #[serde(default = "default_debounce_ms")]
    pub activity_debounce_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_ms(),
            activity_check_interval_ms: default_activity_check_ms(),
            activity_debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_idle_ms() -> u64 {
    30 * 60 * 1000
}

fn default_activity_check_ms() -> u64 {
    60_000
}

fn default_debounce_ms() -> u64 {
    1_000
}

impl SessionConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Background check cadence as a duration.
    pub fn activity_check_interval(&self) -> Duration {
        Duration::from_millis(self.activity_check_interval_ms)
    }

    /// Activity debounce window as a duration.
    pub fn activity_debounce(&self) -> Duration {
        Duration::from_millis(self.activity_debounce_ms)
    }

    /// Reject timeouts that would expire sessions immediately.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(config_error("session.idle_timeout_ms must be > 0"));
        }
        if self.activity_check_interval_ms == 0 {
            return Err(config_error("session.activity_check_interval_ms must be > 0"));
        }
        if self.activity_debounce_ms >= self.idle_timeout_ms {
            return Err(config_error(
                "session.activity_debounce_ms must be below idle_timeout_ms",
            ));
        }
        Ok(())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Resolution of the ticking loop in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1_000
}

impl SchedulerConfig {
    /// Tick resolution as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.tick_ms == 0 {
            return Err(config_error("scheduler.tick_ms must be > 0"));
        }
        Ok(())
    }
}

impl WardenConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional YAML file under `WARDEN__SECTION__FIELD` environment variables.
    ///
    /// `WARDEN__CIRCUIT_BREAKER__RESOURCES` takes a comma-separated list.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_environment(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("circuit_breaker.resources")
    }

    fn load_with_environment(path: Option<&Path>, environment: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        let config: WardenConfig = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section eagerly.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;
        self.circuit_breaker.validate()?;
        self.session.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

fn config_error(msg: &str) -> WardenError {
    WardenError::Config(msg.to_string())
}
