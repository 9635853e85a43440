use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Wrapper for sensitive configuration values.
///
/// Prevents accidental logging of secrets: `Serialize` and `Debug` render a
/// redaction marker. Equality compares the underlying secret so config
/// reloads detect credential changes.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose_secret().is_empty()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl Eq for SensitiveString {}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SensitiveString(***REDACTED***)")
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_redacts() {
        let secret = SensitiveString::new("hunter2");
        assert_eq!(
            serde_json::to_string(&secret).unwrap(),
            "\"***REDACTED***\""
        );
        assert_eq!(format!("{secret:?}"), "SensitiveString(***REDACTED***)");
    }

    #[test]
    fn equality_uses_the_secret() {
        assert_eq!(SensitiveString::new("a"), SensitiveString::new("a"));
        assert_ne!(SensitiveString::new("a"), SensitiveString::new("b"));
    }

    #[test]
    fn deserializes_from_plain_string() {
        let secret: SensitiveString = serde_json::from_str("\"hunter2\"").unwrap();
        assert_eq!(secret.expose_secret(), "hunter2");
    }
}
