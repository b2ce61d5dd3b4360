//! Persisted state types.
//!
//! These are the only entities with on-disk durability: one
//! [`RecordedState`] per (unit, environment) and one [`ContextEntry`] per
//! context key.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{Result, StateError};
use crate::unit::EnvironmentKey;

/// Current version of the persisted record format.
pub const STATE_VERSION: &str = "1.0";

/// Last committed state of a unit in one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedState {
    /// Record format version.
    pub format_version: String,
    /// Unit identifier.
    pub unit_id: String,
    /// Environment the unit was applied to.
    pub environment: EnvironmentKey,
    /// The document the backend confirmed.
    pub document: Value,
    /// Backend resource fingerprint (template hash or version token).
    pub fingerprint: String,
    /// Outputs the backend reported for the unit.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Commit counter, incremented on every successful apply.
    pub revision: u64,
    /// When the record was committed.
    pub committed_at: DateTime<Utc>,
}

impl RecordedState {
    /// Creates a first-revision record.
    #[must_use]
    pub fn new(
        unit_id: &str,
        environment: EnvironmentKey,
        document: Value,
        fingerprint: &str,
        outputs: Map<String, Value>,
    ) -> Self {
        Self {
            format_version: STATE_VERSION.to_string(),
            unit_id: unit_id.to_string(),
            environment,
            document,
            fingerprint: fingerprint.to_string(),
            outputs,
            revision: 1,
            committed_at: Utc::now(),
        }
    }

    /// Builds the record that supersedes this one.
    #[must_use]
    pub fn next_revision(&self, document: Value, fingerprint: &str, outputs: Map<String, Value>) -> Self {
        Self {
            format_version: STATE_VERSION.to_string(),
            unit_id: self.unit_id.clone(),
            environment: self.environment.clone(),
            document,
            fingerprint: fingerprint.to_string(),
            outputs,
            revision: self.revision + 1,
            committed_at: Utc::now(),
        }
    }

    /// Storage key of this record.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.environment, self.unit_id)
    }
}

/// Structured descriptor of an environment lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    /// Provider name, e.g. `availability-zones`.
    pub provider: String,
    /// Environment the fact belongs to.
    pub environment: EnvironmentKey,
    /// Lookup parameters.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl ContextKey {
    /// Creates a key without parameters.
    #[must_use]
    pub fn new(provider: impl Into<String>, environment: EnvironmentKey) -> Self {
        Self {
            provider: provider.into(),
            environment,
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.provider, self.environment)?;
        for (i, (key, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{key}={value}")?;
        }
        Ok(())
    }
}

/// A cached environment fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Record format version.
    pub format_version: String,
    /// Lookup descriptor.
    pub key: ContextKey,
    /// Resolved value.
    pub value: Value,
    /// Set by invalidation; a stale entry is re-resolved on next lookup.
    pub stale: bool,
    /// When the value was resolved.
    pub resolved_at: DateTime<Utc>,
}

impl ContextEntry {
    /// Creates a fresh entry.
    #[must_use]
    pub fn fresh(key: ContextKey, value: Value) -> Self {
        Self {
            format_version: STATE_VERSION.to_string(),
            key,
            value,
            stale: false,
            resolved_at: Utc::now(),
        }
    }
}

/// Parses a persisted record, checking its format version first.
///
/// # Errors
///
/// Returns [`StateError::Corrupted`] for unparseable content and
/// [`StateError::VersionMismatch`] for records written by another format.
pub(crate) fn decode_versioned<T: DeserializeOwned>(content: &str, key: &str) -> Result<T> {
    let raw: Value = serde_json::from_str(content)
        .map_err(|e| StateError::corrupted(key, format!("Invalid JSON: {e}")))?;

    let found = raw
        .get("format_version")
        .and_then(Value::as_str)
        .unwrap_or("missing");
    if found != STATE_VERSION {
        return Err(StateError::VersionMismatch {
            key: key.to_string(),
            expected: STATE_VERSION.to_string(),
            found: found.to_string(),
        }
        .into());
    }

    serde_json::from_value(raw)
        .map_err(|e| StateError::corrupted(key, format!("Unexpected record shape: {e}")).into())
}

/// Makes an identifier safe to use as a single path or object-key component.
pub(crate) fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    if out.is_empty() || out.starts_with('.') {
        out.insert(0, '%');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_revision() {
        let env = EnvironmentKey::new("acct", "eu-west-1");
        let first = RecordedState::new("network", env, json!({"cidr": "10.0.0.0/16"}), "fp1", Map::new());
        let second = first.next_revision(json!({"cidr": "10.1.0.0/16"}), "fp2", Map::new());

        assert_eq!(first.revision, 1);
        assert_eq!(second.revision, 2);
        assert_eq!(second.unit_id, "network");
        assert_eq!(second.key(), "acct/eu-west-1/network");
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("eu-west-1"), "eu-west-1");
        assert_eq!(encode_component("a/b"), "a%2Fb");
        assert_eq!(encode_component(".."), "%..");
    }

    #[test]
    fn test_decode_rejects_other_versions() {
        let err = decode_versioned::<RecordedState>(r#"{"format_version": "0.9"}"#, "k")
            .expect_err("must fail");
        assert!(err.to_string().contains("0.9"));
    }

    #[test]
    fn test_context_key_display() {
        let key = ContextKey::new("availability-zones", EnvironmentKey::new("acct", "us-east-1"))
            .with_param("tier", "public")
            .with_param("count", "2");

        assert_eq!(key.to_string(), "availability-zones@acct/us-east-1?count=2&tier=public");
    }
}
