//! Session fingerprints derived from the caller's environment.

use hex::ToHex;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Display geometry reported by the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DisplayGeometry {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Color depth in bits
    pub color_depth: u8,
}

/// Environment attributes available when a session starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    /// User agent string
    pub user_agent: String,
    /// Preferred locale, e.g. `en-US`
    pub locale: String,
    /// Screen or viewport geometry
    pub display: DisplayGeometry,
    /// Offset from UTC in minutes
    pub timezone_offset_minutes: i32,
    /// Hash of rendering-surface output
    pub surface_hash: String,
}

/// Source of the current environment attributes.
pub trait EnvironmentProbe: Send + Sync + fmt::Debug {
    /// Read the attributes as they are right now.
    fn snapshot(&self) -> EnvironmentSnapshot;
}

/// Probe returning a snapshot held in memory and replaced explicitly.
///
/// Used where the embedding application pushes environment updates rather
/// than having them polled, and in tests.
#[derive(Debug, Default)]
pub struct StaticEnvironment {
    snapshot: RwLock<EnvironmentSnapshot>,
}

impl StaticEnvironment {
    /// Create a probe reporting `snapshot`.
    pub fn new(snapshot: EnvironmentSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Replace the reported snapshot.
    pub fn set(&self, snapshot: EnvironmentSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Modify the reported snapshot in place.
    pub fn update(&self, f: impl FnOnce(&mut EnvironmentSnapshot)) {
        f(&mut self.snapshot.write());
    }
}

impl EnvironmentProbe for StaticEnvironment {
    fn snapshot(&self) -> EnvironmentSnapshot {
        self.snapshot.read().clone()
    }
}

/// Opaque, fixed-length session fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionFingerprint(String);

impl SessionFingerprint {
    /// Wrap a fingerprint produced by a strategy.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The fingerprint as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a fingerprint is derived from environment attributes.
///
/// Swap this out for a stronger device-binding mechanism without touching
/// the integrity-check logic.
pub trait FingerprintStrategy: Send + Sync + fmt::Debug {
    /// Derive the fingerprint. Must be deterministic.
    fn derive(&self, environment: &EnvironmentSnapshot) -> SessionFingerprint;
}

/// SHA-256 over length-prefixed environment attributes, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Fingerprint;

impl Sha256Fingerprint {
    fn feed(hasher: &mut Sha256, field: &[u8]) {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
}

impl FingerprintStrategy for Sha256Fingerprint {
    fn derive(&self, environment: &EnvironmentSnapshot) -> SessionFingerprint {
        let mut hasher = Sha256::new();
        Self::feed(&mut hasher, environment.user_agent.as_bytes());
        Self::feed(&mut hasher, environment.locale.as_bytes());
        Self::feed(&mut hasher, &environment.display.width.to_be_bytes());
        Self::feed(&mut hasher, &environment.display.height.to_be_bytes());
        Self::feed(&mut hasher, &[environment.display.color_depth]);
        Self::feed(&mut hasher, &environment.timezone_offset_minutes.to_be_bytes());
        Self::feed(&mut hasher, environment.surface_hash.as_bytes());

        SessionFingerprint(hasher.finalize().encode_hex::<String>())
    }
}
