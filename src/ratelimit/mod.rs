//! Rate limiting logic and state management.

mod key;
mod limiter;
mod record;

pub use key::{CallerId, TrafficKey};
pub use limiter::RateLimiter;
pub use record::{Limit, TrafficRecord, TrafficSnapshot};
