//! Backend protocol types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque identifier of a submitted change set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(String);

impl BackendHandle {
    /// Wraps a backend-issued identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Progress of a submitted change set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendStatus {
    /// Still being applied.
    InProgress,
    /// Applied.
    Succeeded {
        /// Resource fingerprint (template hash or version token).
        fingerprint: String,
        /// Values the unit exposes to dependents.
        #[serde(default)]
        outputs: Map<String, Value>,
    },
    /// Terminal failure.
    Failed {
        /// Backend-provided failure details.
        #[serde(default)]
        diagnostics: Vec<String>,
    },
}

impl BackendStatus {
    /// Returns true once the backend will not change the status again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}
