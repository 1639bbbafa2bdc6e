//! Memory entry types and key validation.

use super::AccessLevel;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Maximum namespace length.
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Maximum key length.
pub const MAX_KEY_LEN: usize = 512;

static NAMESPACE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").ok());

/// Validates a namespace name.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the namespace is empty, too long, or
/// contains characters outside `[a-z0-9._-]`.
pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE_LEN {
        return Err(Error::Validation(format!(
            "namespace must be 1..={MAX_NAMESPACE_LEN} characters, got {}",
            namespace.len()
        )));
    }
    let valid = NAMESPACE_RE
        .as_ref()
        .is_some_and(|re| re.is_match(namespace));
    if !valid {
        return Err(Error::Validation(format!(
            "invalid namespace '{namespace}': use lowercase letters, digits, '.', '_' or '-'"
        )));
    }
    Ok(())
}

/// Validates an entry key.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the key is empty, too long, contains
/// control characters, or contains glob metacharacters.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::Validation(format!(
            "key must be 1..={MAX_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(Error::Validation(
            "key must not contain control characters".to_string(),
        ));
    }
    if key.contains(['*', '?']) {
        return Err(Error::Validation(format!(
            "key '{key}' must not contain glob characters '*' or '?'"
        )));
    }
    Ok(())
}

/// A validated `(namespace, key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    namespace: String,
    key: String,
}

impl EntryKey {
    /// Creates a validated entry key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if either part is malformed.
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let key = key.into();
        validate_namespace(&namespace)?;
        validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    /// Rebuilds a key read back from storage, where it was validated on write.
    pub(crate) const fn from_stored(namespace: String, key: String) -> Self {
        Self { namespace, key }
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the key within the namespace.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// A persisted key/value entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    /// Namespace and key.
    pub key: EntryKey,
    /// Opaque caller-defined payload.
    pub value: Vec<u8>,
    /// Owning agent.
    pub owner: String,
    /// Owner's team at write time.
    pub owner_team: Option<String>,
    /// Owner's swarm at write time.
    pub owner_swarm: Option<String>,
    /// Read-time visibility.
    pub access_level: AccessLevel,
    /// Lifetime in seconds; 0 never expires.
    pub ttl_seconds: u64,
    /// Creation (last write) time, Unix milliseconds.
    pub created_at: u64,
    /// Monotonic write version.
    pub version: u64,
}

impl MemoryEntry {
    /// Instant after which the entry is expired, if it has a TTL.
    #[must_use]
    pub const fn expires_at(&self) -> Option<u64> {
        if self.ttl_seconds == 0 {
            None
        } else {
            Some(
                self.created_at
                    .saturating_add(self.ttl_seconds.saturating_mul(1000)),
            )
        }
    }

    /// Whether the entry is expired at `now_millis`.
    #[must_use]
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        self.expires_at().is_some_and(|at| now_millis > at)
    }

    /// Creation time as a UTC datetime.
    #[must_use]
    pub fn created_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        i64::try_from(self.created_at)
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("agents" ; "plain")]
    #[test_case("blackboard" ; "blackboard")]
    #[test_case("team-7.tasks_v2" ; "punctuation")]
    #[test_case("0" ; "single digit")]
    fn test_valid_namespaces(ns: &str) {
        assert!(validate_namespace(ns).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("Agents" ; "uppercase")]
    #[test_case("-leading" ; "leading dash")]
    #[test_case("has space" ; "space")]
    #[test_case("a/b" ; "slash")]
    fn test_invalid_namespaces(ns: &str) {
        assert!(matches!(validate_namespace(ns), Err(Error::Validation(_))));
    }

    #[test]
    fn test_namespace_too_long() {
        let ns = "a".repeat(MAX_NAMESPACE_LEN + 1);
        assert!(validate_namespace(&ns).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("agent/42/task").is_ok());
        assert!(validate_key("queue/next").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("queue/*").is_err());
        assert!(validate_key("what?").is_err());
        assert!(validate_key("line\nbreak").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_entry_expiry() {
        let entry = MemoryEntry {
            key: EntryKey::new("ns", "k").unwrap(),
            value: vec![1],
            owner: "a".into(),
            owner_team: None,
            owner_swarm: None,
            access_level: AccessLevel::Private,
            ttl_seconds: 60,
            created_at: 1_000,
            version: 1,
        };
        assert_eq!(entry.expires_at(), Some(61_000));
        assert!(!entry.is_expired_at(61_000));
        assert!(entry.is_expired_at(61_001));

        let forever = MemoryEntry {
            ttl_seconds: 0,
            ..entry
        };
        assert_eq!(forever.expires_at(), None);
        assert!(!forever.is_expired_at(u64::MAX));
    }
}
