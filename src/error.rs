//! Error types for the Stackwright orchestration engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph resolution, document validation, state storage,
//! context lookups, backend calls, and orchestration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the Stackwright engine.
#[derive(Debug, Error)]
pub enum StackwrightError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors (cycles, unknown references).
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Malformed desired-state documents.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// State store errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Context cache errors.
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    /// Provisioning backend errors.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Orchestration errors.
    #[error("Orchestration error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The project file was not found.
    #[error("Project file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The project file could not be parsed.
    #[error("Failed to parse project file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Project validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Dependency graph errors. These abort a run before any backend call.
#[derive(Debug, Error)]
pub enum GraphError {
    /// No topological order exists.
    #[error("Dependency cycle between units: {}", units.join(", "))]
    Cycle {
        /// Every unit that participates in a cycle, in declaration order.
        units: Vec<String>,
    },

    /// A unit depends on (or references) a unit that is not part of the run.
    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnknownDependency {
        /// The declaring unit.
        unit: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Two units share an identifier.
    #[error("Duplicate unit identifier: {unit}")]
    DuplicateUnit {
        /// The duplicated identifier.
        unit: String,
    },
}

/// Desired-state document errors. Fatal for the affected unit only.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The document is not structurally acceptable.
    #[error("Malformed document for unit '{unit}': {message}")]
    MalformedDocument {
        /// Unit owning the document.
        unit: String,
        /// What is wrong with it.
        message: String,
    },

    /// A `${...}` token could not be parsed.
    #[error("Invalid reference '{token}' in unit '{unit}': {message}")]
    InvalidReference {
        /// Unit owning the document.
        unit: String,
        /// The offending token.
        token: String,
        /// Description of the problem.
        message: String,
    },

    /// A referenced output was not produced by the upstream unit.
    #[error("Unit '{unit}' references missing output '{output}' of unit '{producer}'")]
    MissingOutput {
        /// Consuming unit.
        unit: String,
        /// Producing unit.
        producer: String,
        /// Output name.
        output: String,
    },
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A persisted record exists but cannot be read or parsed.
    #[error("State record '{key}' is corrupted: {message}")]
    Corrupted {
        /// Storage key of the record.
        key: String,
        /// Description of the corruption.
        message: String,
    },

    /// A persisted record has an unsupported format version.
    #[error("State record '{key}' has version {found}, expected {expected}")]
    VersionMismatch {
        /// Storage key of the record.
        key: String,
        /// Expected format version.
        expected: String,
        /// Found format version.
        found: String,
    },

    /// Run lock acquisition failed.
    #[error("Failed to acquire run lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// A held run lock was taken over or removed.
    #[error("Run lock {lock_id} is no longer held by this process")]
    LockLost {
        /// Identifier of the lock that was lost.
        lock_id: String,
    },

    /// Run lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The storage medium failed (filesystem, S3).
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },
}

/// Context cache errors.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Refused to overwrite a fresh entry without consent.
    #[error("Context entry '{key}' is frozen; invalidate it or pass overwrite to replace it")]
    Frozen {
        /// The entry key.
        key: String,
    },

    /// The resolver callback failed.
    #[error("Failed to resolve context '{key}': {message}")]
    ResolutionFailed {
        /// The entry key.
        key: String,
        /// Resolver failure description.
        message: String,
    },

    /// A context key descriptor could not be parsed.
    #[error("Invalid context key '{descriptor}': {message}")]
    InvalidKey {
        /// The raw descriptor.
        descriptor: String,
        /// Description of the problem.
        message: String,
    },
}

/// Provisioning backend errors.
///
/// [`BackendError::is_transient`] is the retry classification policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The backend asked us to slow down.
    #[error("Backend throttled the request, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The backend is temporarily unavailable (502/503/504).
    #[error("Backend unavailable ({status}): {message}")]
    Unavailable {
        /// HTTP status code.
        status: u16,
        /// Response body or description.
        message: String,
    },

    /// Connection-level failure.
    #[error("Network error communicating with backend: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// A single backend call exceeded its deadline.
    #[error("Backend call '{operation}' timed out after {after_ms}ms")]
    Timeout {
        /// The timed-out operation.
        operation: String,
        /// The deadline that elapsed.
        after_ms: u64,
    },

    /// The backend rejected the request.
    #[error("Backend rejected the request: {status} - {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Message from the backend.
        message: String,
    },

    /// Authentication failed.
    #[error("Backend authentication failed: {message}")]
    Unauthorized {
        /// Description of the failure.
        message: String,
    },

    /// The backend no longer knows the submitted change set.
    #[error("Backend handle not found: {handle}")]
    HandleNotFound {
        /// The unknown handle.
        handle: String,
    },

    /// The backend answered with something we cannot interpret.
    #[error("Invalid response from backend: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Transient failures persisted past the retry budget.
    #[error("Backend call '{operation}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// The retried operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last transient error observed.
        last: Box<BackendError>,
    },
}

/// Orchestration errors.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The run was cancelled before this unit could start.
    #[error("Run cancelled")]
    Cancelled,

    /// A unit task ended abnormally.
    #[error("Unit task for '{unit}' aborted: {reason}")]
    TaskAborted {
        /// Unit whose task aborted.
        unit: String,
        /// Reason for abort.
        reason: String,
    },

    /// The backend accepted a change set but stopped answering polls for it.
    #[error("Outcome of change set {handle} for '{unit}' is unknown: {message}")]
    OutcomeUnknown {
        /// Unit whose change set is unaccounted for.
        unit: String,
        /// Backend handle of the change set.
        handle: String,
        /// Last polling error.
        message: String,
    },

    /// Invalid run options.
    #[error("Invalid run options: {message}")]
    InvalidOptions {
        /// Description of the problem.
        message: String,
    },
}

/// Coarse classification used when surfacing unit failures to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Unresolvable dependency graph.
    Cycle,
    /// Malformed desired-state document.
    Validation,
    /// Retryable backend failure (only surfaced once retries are exhausted).
    TransientBackend,
    /// Non-retryable backend failure.
    TerminalBackend,
    /// Persisted state violates its invariants.
    StateCorruption,
    /// Context lookup failure.
    Context,
    /// The run was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

/// Result type alias for Stackwright operations.
pub type Result<T> = std::result::Result<T, StackwrightError>;

impl StackwrightError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Backend(e) => e.is_transient(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }

    /// Returns the server-suggested retry delay, if any.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Backend(e) => e.retry_delay(),
            _ => None,
        }
    }

    /// Classifies the error for reporting.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Graph(GraphError::Cycle { .. }) => ErrorClass::Cycle,
            Self::Graph(_) | Self::Validation(_) | Self::Config(_) => ErrorClass::Validation,
            Self::Backend(BackendError::RetriesExhausted { .. })
            | Self::Orchestrator(OrchestratorError::OutcomeUnknown { .. }) => ErrorClass::TransientBackend,
            Self::Backend(e) if e.is_transient() => ErrorClass::TransientBackend,
            Self::Backend(_) => ErrorClass::TerminalBackend,
            Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. }) => {
                ErrorClass::StateCorruption
            }
            Self::Context(_) => ErrorClass::Context,
            Self::Orchestrator(OrchestratorError::Cancelled) => ErrorClass::Cancelled,
            _ => ErrorClass::Internal,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error for a storage key.
    #[must_use]
    pub fn corrupted(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl BackendError {
    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true for failures worth retrying: throttling, temporary
    /// unavailability, connection errors and per-call timeouts.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. }
                | Self::Unavailable { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
        )
    }

    /// Returns the server-suggested retry delay, if any.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after_secs } => Some(Duration::from_secs(*retry_after_secs)),
            _ => None,
        }
    }

    /// Maps an HTTP status to a backend error using the classification policy.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Self::Unauthorized { message },
            502..=504 => Self::Unavailable { status, message },
            _ => Self::Rejected { status, message },
        }
    }
}
