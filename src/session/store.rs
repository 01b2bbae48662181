//! Session-scoped storage.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;

use super::fingerprint::SessionFingerprint;

/// Storage that lives exactly as long as one signed-in session.
///
/// The governance layer keeps the captured fingerprint here; the
/// authentication boundary may keep cached credentials here too. Teardown
/// clears all of it.
pub trait SessionStore: Send + Sync + Debug {
    /// The fingerprint captured for this session, if any.
    fn fingerprint(&self) -> Option<SessionFingerprint>;

    /// Capture the fingerprint for this session.
    fn store_fingerprint(&self, fingerprint: SessionFingerprint);

    /// Remove everything held for the session.
    fn clear(&self);
}

#[derive(Debug, Default)]
struct Scope {
    fingerprint: Option<SessionFingerprint>,
    values: HashMap<String, String>,
}

/// In-memory session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    scope: RwLock<Scope>,
}

impl MemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep an arbitrary session-scoped value (e.g. a cached token).
    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.scope.write().values.insert(key.into(), value.into());
    }

    /// Read a session-scoped value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.scope.read().values.get(key).cloned()
    }

    /// Whether nothing is held for the session.
    pub fn is_empty(&self) -> bool {
        let scope = self.scope.read();
        scope.fingerprint.is_none() && scope.values.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn fingerprint(&self) -> Option<SessionFingerprint> {
        self.scope.read().fingerprint.clone()
    }

    fn store_fingerprint(&self, fingerprint: SessionFingerprint) {
        self.scope.write().fingerprint = Some(fingerprint);
    }

    fn clear(&self) {
        let mut scope = self.scope.write();
        scope.fingerprint = None;
        scope.values.clear();
    }
}
