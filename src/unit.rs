//! Deployable units and their deployment targets.
//!
//! A [`DeployableUnit`] is the independently provisionable group of resources
//! (a "stack") the orchestrator drives. Units are built by the caller before a
//! run and are treated as immutable while the run is in flight.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The (account, region) pair identifying a deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentKey {
    /// Account-equivalent identifier.
    account: String,
    /// Region-equivalent identifier.
    region: String,
}

impl EnvironmentKey {
    /// Creates a new environment key.
    #[must_use]
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }

    /// Returns the account identifier.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns the region identifier.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Lifecycle state of a unit within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Waiting for dependencies (or for a scheduling slot).
    #[default]
    Pending,
    /// Computing the change set.
    Diffing,
    /// Handing the change set to the backend.
    Submitting,
    /// The backend is applying the change set.
    InProgress,
    /// Terminal success.
    Succeeded,
    /// Terminal failure.
    Failed,
    /// Terminal failure that was reverted.
    RolledBack,
    /// Dry run: change set computed, nothing submitted.
    Planned,
}

impl UnitState {
    /// Returns true for states a unit never leaves within a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::RolledBack | Self::Planned
        )
    }

    /// Returns true if dependents may proceed past this state.
    #[must_use]
    pub const fn unblocks_dependents(self) -> bool {
        matches!(self, Self::Succeeded | Self::Planned)
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Diffing => "diffing",
            Self::Submitting => "submitting",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Planned => "planned",
        };
        write!(f, "{s}")
    }
}

/// A named, independently provisionable group of declared resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployableUnit {
    /// Identifier, unique within the run.
    pub id: String,
    /// Where the unit is provisioned.
    pub environment: EnvironmentKey,
    /// Explicit dependencies, in declaration order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Desired-state document.
    pub document: Value,
    /// Extra document paths whose modification forces replacement.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// Last known lifecycle state, updated from run reports by the caller.
    #[serde(skip)]
    pub status: UnitState,
}

impl DeployableUnit {
    /// Creates a unit with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, environment: EnvironmentKey, document: Value) -> Self {
        Self {
            id: id.into(),
            environment,
            depends_on: Vec::new(),
            document,
            replace_on: Vec::new(),
            status: UnitState::Pending,
        }
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, unit: impl Into<String>) -> Self {
        self.depends_on.push(unit.into());
        self
    }

    /// Adds a replacement pattern.
    #[must_use]
    pub fn replace_on(mut self, pattern: impl Into<String>) -> Self {
        self.replace_on.push(pattern.into());
        self
    }

    /// Returns the storage key for this unit's recorded state.
    #[must_use]
    pub fn record_key(&self) -> String {
        format!("{}/{}", self.environment, self.id)
    }
}
