//! Guarded calls: rate limiting, then circuit breaking, under a session veto.

mod dispatcher;
mod error;

pub use dispatcher::GuardedCallDispatcher;
pub use error::GuardError;
