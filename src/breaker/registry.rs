//! Breakers per resource class.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::audit::SharedSink;
use crate::clock::SharedClock;
use crate::config::CircuitBreakerConfig;
use crate::error::Result;

use super::circuit::{BreakerSnapshot, CircuitBreaker, CircuitState};

/// Resource class shared by operations whose class has no breaker of its own.
pub const DEFAULT_RESOURCE: &str = "default";

/// Fixed set of breakers created at start-up.
///
/// Operation keys map to resource classes by the segment before the first
/// `:` (`"auth:refresh"` belongs to `auth`). Classes without a configured
/// breaker share the `default` one, so the table never grows at runtime.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create one breaker per configured resource plus the default breaker.
    pub fn new(config: &CircuitBreakerConfig, clock: SharedClock, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let mut breakers = HashMap::new();
        let resources = config
            .resources
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(DEFAULT_RESOURCE));

        for resource in resources {
            if breakers.contains_key(resource) {
                continue;
            }
            let breaker = CircuitBreaker::new(resource, config, Arc::clone(&clock), Arc::clone(&sink))?;
            debug!(resource, "Created circuit breaker");
            breakers.insert(resource.to_string(), Arc::new(breaker));
        }

        Ok(Self { breakers })
    }

    /// Resource class an operation key belongs to.
    pub fn resource_class(operation_key: &str) -> &str {
        operation_key
            .split_once(':')
            .map(|(class, _)| class)
            .unwrap_or(operation_key)
    }

    /// Breaker guarding an operation key.
    pub fn for_operation(&self, operation_key: &str) -> &Arc<CircuitBreaker> {
        self.get(Self::resource_class(operation_key))
            .unwrap_or_else(|| self.fallback())
    }

    /// Breaker for a resource class, if one was configured.
    pub fn get(&self, resource: &str) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(resource)
    }

    /// State of the breaker guarding an operation key.
    pub fn state(&self, operation_key: &str) -> CircuitState {
        self.for_operation(operation_key).state()
    }

    /// Snapshots of every breaker, sorted by resource.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.resource.cmp(&b.resource));
        snapshots
    }

    /// Configured resource classes, sorted.
    pub fn resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.breakers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn fallback(&self) -> &Arc<CircuitBreaker> {
        // DEFAULT_RESOURCE is always inserted by `new`
        &self.breakers[DEFAULT_RESOURCE]
    }
}
