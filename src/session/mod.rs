//! Session integrity: environment fingerprinting and idle expiry.

mod activity;
mod fingerprint;
mod monitor;
mod store;

pub use activity::ActivityClock;
pub use fingerprint::{
    DisplayGeometry, EnvironmentProbe, EnvironmentSnapshot, FingerprintStrategy,
    SessionFingerprint, Sha256Fingerprint, StaticEnvironment,
};
pub use monitor::{SessionIntegrityMonitor, TeardownHook, TerminationReason};
pub use store::{MemorySessionStore, SessionStore};
