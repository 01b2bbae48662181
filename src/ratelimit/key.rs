//! Traffic key generation.

use std::fmt;

use crate::error::{Result, WardenError};

/// Who is making a call, at the granularity limits are applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerId {
    /// An authenticated user
    User(String),
    /// A network address
    Ip(String),
    /// Every caller at once
    Global,
}

impl CallerId {
    /// Caller identified by user id.
    pub fn user(id: impl Into<String>) -> Self {
        CallerId::User(id.into())
    }

    /// Caller identified by network address.
    pub fn ip(addr: impl Into<String>) -> Self {
        CallerId::Ip(addr.into())
    }

    fn validate(&self) -> Result<()> {
        match self {
            CallerId::User(id) | CallerId::Ip(id) if id.is_empty() => Err(
                WardenError::InvalidArgument("caller identifier must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerId::User(id) => write!(f, "user:{}", id),
            CallerId::Ip(addr) => write!(f, "ip:{}", addr),
            CallerId::Global => f.write_str("global"),
        }
    }
}

/// A non-empty key identifying one traffic record.
///
/// Composite keys take the form `<scope>:<operation>`, e.g.
/// `user:42:create_invoice` or `global:login`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficKey(String);

impl TrafficKey {
    /// Wrap a raw key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(WardenError::InvalidArgument(
                "rate limit key must not be empty".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Build the composite key for a caller performing an operation.
    pub fn compose(caller: &CallerId, operation: &str) -> Result<Self> {
        caller.validate()?;
        if operation.is_empty() {
            return Err(WardenError::InvalidArgument(
                "operation key must not be empty".to_string(),
            ));
        }
        Ok(Self(format!("{}:{}", caller, operation)))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrafficKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrafficKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_keys() {
        let key = TrafficKey::compose(&CallerId::user("42"), "create_invoice").unwrap();
        assert_eq!(key.as_str(), "user:42:create_invoice");

        let key = TrafficKey::compose(&CallerId::ip("10.0.0.1"), "login").unwrap();
        assert_eq!(key.to_string(), "ip:10.0.0.1:login");

        let key = TrafficKey::compose(&CallerId::Global, "signup").unwrap();
        assert_eq!(key.as_str(), "global:signup");
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(TrafficKey::new("").is_err());
        assert!(TrafficKey::compose(&CallerId::user(""), "login").is_err());
        assert!(TrafficKey::compose(&CallerId::Global, "").is_err());
    }
}
