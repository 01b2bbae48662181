//! Circuit breaking around downstream dependencies.

mod circuit;
mod registry;

pub use circuit::{BreakerError, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use registry::{BreakerRegistry, DEFAULT_RESOURCE};
