//! Run options, progress events and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::backend::RetryPolicy;
use crate::error::{ErrorClass, OrchestratorError, Result, StackwrightError};
use crate::planner::ChangeSet;
use crate::state::LOCK_EXPIRY_SECS;
use crate::unit::{DeployableUnit, EnvironmentKey, UnitState};

/// Default number of units driven concurrently.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// Default delay between two polls of an in-progress change set.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

/// What a run does to its units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    /// Converge units to their desired documents, dependencies first.
    #[default]
    Deploy,
    /// Tear units down, dependents first.
    Destroy,
    /// Converge units back to their recorded documents, dependents first.
    Rollback,
}

impl ApplyMode {
    /// Returns true for the modes that walk the graph in reverse.
    #[must_use]
    pub const fn is_reverse(self) -> bool {
        matches!(self, Self::Destroy | Self::Rollback)
    }
}

impl std::fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deploy => "deploy",
            Self::Destroy => "destroy",
            Self::Rollback => "rollback",
        };
        write!(f, "{s}")
    }
}

/// Options of one run.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of units driven at once.
    pub concurrency_limit: usize,
    /// Revert a unit whose deploy fails terminally.
    pub rollback_on_failure: bool,
    /// Compute change sets without submitting them.
    pub dry_run: bool,
    /// Retry policy for every backend call.
    pub retry: RetryPolicy,
    /// Delay between two polls of an in-progress change set.
    pub poll_interval: Duration,
    /// How often a live run renews its run lock. Must stay well below the
    /// lock lifetime.
    pub lock_refresh_interval: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            rollback_on_failure: true,
            dry_run: false,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            lock_refresh_interval: Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs() / 3),
        }
    }
}

impl ApplyOptions {
    /// Checks that the options describe a runnable configuration.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidOptions`] otherwise.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(OrchestratorError::InvalidOptions {
                message: String::from("concurrency_limit must be at least 1"),
            }
            .into());
        }
        if self.lock_refresh_interval.is_zero() {
            return Err(OrchestratorError::InvalidOptions {
                message: String::from("lock_refresh_interval must be positive"),
            }
            .into());
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::InvalidOptions {
                message: String::from("retry.max_attempts must be at least 1"),
            }
            .into());
        }
        Ok(())
    }
}

/// A unit state transition.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Run the event belongs to.
    pub run_id: Uuid,
    /// Unit identifier.
    pub unit_id: String,
    /// Target environment.
    pub environment: EnvironmentKey,
    /// State entered.
    pub state: UnitState,
    /// Extra detail, e.g. a backend handle or an error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

/// Why a unit did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitError {
    /// Error classification.
    pub class: ErrorClass,
    /// Error message.
    pub message: String,
    /// Backend diagnostics, if any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl UnitError {
    /// Builds a unit error from a crate error.
    #[must_use]
    pub fn from_error(error: &StackwrightError) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
            diagnostics: Vec::new(),
        }
    }
}

/// Final status of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    /// Unit identifier.
    pub unit_id: String,
    /// Target environment.
    pub environment: EnvironmentKey,
    /// State the unit ended in.
    pub state: UnitState,
    /// Last non-terminal state reached, useful to locate a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_state: Option<UnitState>,
    /// Change set computed for the unit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    /// Number of change sets handed to the backend.
    pub submissions: u32,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<UnitError>,
    /// Units whose failure kept this one pending.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl UnitOutcome {
    /// Creates a pending outcome.
    #[must_use]
    pub fn pending(unit: &DeployableUnit) -> Self {
        Self {
            unit_id: unit.id.clone(),
            environment: unit.environment.clone(),
            state: UnitState::Pending,
            last_active_state: None,
            change_set: None,
            submissions: 0,
            error: None,
            blocked_by: Vec::new(),
        }
    }

    /// Returns true if the unit unblocked its dependents.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.state.unblocks_dependents()
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// Run mode.
    pub mode: ApplyMode,
    /// Whether the run only planned.
    pub dry_run: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// One outcome per unit, in processing order.
    pub outcomes: Vec<UnitOutcome>,
}

impl RunReport {
    /// Returns the outcome of a unit.
    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.unit_id == unit_id)
    }

    /// Returns true if every unit succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(UnitOutcome::is_success)
    }

    /// Counts outcomes in a given state.
    #[must_use]
    pub fn count(&self, state: UnitState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// Returns the processing order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.unit_id.as_str()).collect()
    }

    /// Copies the final states onto the caller's units.
    pub fn apply_to(&self, units: &mut [DeployableUnit]) {
        for unit in units {
            if let Some(outcome) = self.get(&unit.id) {
                unit.status = outcome.state;
            }
        }
    }
}
