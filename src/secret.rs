//! Secret string handling for credentials and tokens.
//!
//! [`SecretString`] wraps client secrets, refresh tokens, and raw bearer
//! tokens so they cannot leak through `Debug` output, `tracing` fields, or
//! error messages. The value serializes transparently as a plain string,
//! which keeps stored records (registered clients, token records) readable
//! by the storage backend.

use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A string wrapper that redacts its contents in Debug and Display output.
///
/// Use [`expose()`](SecretString::expose) at the single point where the
/// secret actually crosses the wire (an `Authorization` header, a form
/// body); everywhere else the value stays opaque.
///
/// # Example
///
/// ```rust
/// use mcp_delegate::SecretString;
///
/// let secret = SecretString::new("cs-9f8e7d");
/// assert_eq!(format!("{:?}", secret), "[REDACTED]");
/// assert_eq!(secret.expose(), "cs-9f8e7d");
/// ```
#[derive(Clone, Default)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a sensitive value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Returns true if the wrapped value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for SecretString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Display for SecretString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl PartialEq for SecretString {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SecretString {}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// Serializes as a plain string so persisted records survive a round-trip
// through the storage backend.
impl Serialize for SecretString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::new("client-secret-value");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_expose_returns_value() {
        let secret = SecretString::new("client-secret-value");
        assert_eq!(secret.expose(), "client-secret-value");
        assert_eq!(secret.into_inner(), "client-secret-value");
    }

    #[test]
    fn test_struct_debug_does_not_leak() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct Credential {
            client_id: String,
            client_secret: SecretString,
        }

        let cred = Credential {
            client_id: "c123".to_string(),
            client_secret: SecretString::new("super-secret"),
        };

        let output = format!("{:?}", cred);
        assert!(output.contains("c123"));
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("super-secret"));
    }

    #[test]
    fn test_serde_roundtrip_is_transparent() {
        let secret = SecretString::new("cs-1");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"cs-1\"");

        let parsed: SecretString = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, secret);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(SecretString::default().is_empty());
    }
}
