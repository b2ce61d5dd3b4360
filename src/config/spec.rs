//! Project file types.
//!
//! This module defines the structs that map to `stackwright.yaml`. A project
//! file names the state location, the provisioning backend, run defaults and
//! the list of deployable units.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use validator::Validate;

use crate::backend::RetryPolicy;
use crate::error::{ConfigError, Result};
use crate::orchestrator::{ApplyOptions, DEFAULT_CONCURRENCY_LIMIT};
use crate::planner::DiffEngine;
use crate::unit::{DeployableUnit, EnvironmentKey};

/// The root of a Stackwright project file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct StackConfig {
    /// Project-level settings.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// Where recorded state and context entries live.
    #[serde(default)]
    pub state: StateConfig,
    /// Provisioning backend.
    #[validate(nested)]
    pub backend: BackendConfig,
    /// Run defaults.
    #[serde(default)]
    #[validate(nested)]
    pub orchestrator: OrchestratorConfig,
    /// Extra document paths whose modification forces replacement, for
    /// every unit. `/type` and `/name` always do.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// Units to deploy.
    #[serde(default)]
    #[validate(nested)]
    pub units: Vec<UnitConfig>,
}

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Project name.
    #[validate(length(min = 1, message = "Project name cannot be empty"))]
    pub name: String,
    /// Default account for units that do not name one.
    #[serde(default)]
    pub account: Option<String>,
    /// Default region for units that do not name one.
    #[serde(default)]
    pub region: Option<String>,
}

/// State storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Storage type.
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region, the AWS default chain is used if unset.
    #[serde(default)]
    pub region: Option<String>,
}

/// State storage types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local directory.
    #[default]
    Local,
    /// AWS S3 bucket.
    S3,
}

/// Provisioning backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct BackendConfig {
    /// Service root URL.
    #[validate(length(min = 1, message = "Backend URL cannot be empty"))]
    pub url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    #[validate(range(min = 1, message = "Request timeout must be at least 1 second"))]
    pub timeout_secs: u64,
}

/// Run defaults, overridable from the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct OrchestratorConfig {
    /// Maximum number of units driven at once.
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, message = "Concurrency limit must be at least 1"))]
    pub concurrency_limit: usize,
    /// Revert a unit whose deploy fails.
    #[serde(default = "default_rollback_on_failure")]
    pub rollback_on_failure: bool,
    /// Delay between polls of an in-progress change set.
    #[serde(default = "default_poll_interval")]
    #[validate(range(min = 1, message = "Poll interval must be at least 1ms"))]
    pub poll_interval_ms: u64,
    /// Retry policy for backend calls.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Attempts per call, including the first one.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20, message = "Retry attempts must be between 1 and 20"))]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Deadline of a single backend call.
    #[serde(default = "default_call_timeout")]
    #[validate(range(min = 1, message = "Call timeout must be at least 1 second"))]
    pub call_timeout_secs: u64,
}

/// One deployable unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct UnitConfig {
    /// Unit identifier.
    #[validate(length(min = 1, message = "Unit id cannot be empty"))]
    pub id: String,
    /// Target account, defaults to `project.account`.
    #[serde(default)]
    pub account: Option<String>,
    /// Target region, defaults to `project.region`.
    #[serde(default)]
    pub region: Option<String>,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Extra replacement patterns for this unit.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// Desired-state document.
    pub document: Value,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency(),
            rollback_on_failure: default_rollback_on_failure(),
            poll_interval_ms: default_poll_interval(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_secs: default_max_delay(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

// Default value functions

const fn default_request_timeout() -> u64 {
    30
}

const fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

const fn default_rollback_on_failure() -> bool {
    true
}

const fn default_poll_interval() -> u64 {
    2000
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay() -> u64 {
    500
}

const fn default_max_delay() -> u64 {
    30
}

const fn default_call_timeout() -> u64 {
    60
}

impl StackConfig {
    /// Returns the unit identifiers in declaration order.
    #[must_use]
    pub fn unit_ids(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.id.as_str()).collect()
    }

    /// Builds the deployable units, filling in the project's default
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a unit has no account or region.
    pub fn deployable_units(&self) -> Result<Vec<DeployableUnit>> {
        self.units
            .iter()
            .enumerate()
            .map(|(i, unit)| -> Result<DeployableUnit> {
                let environment = unit.environment(&self.project).ok_or_else(|| {
                    ConfigError::validation(
                        format!("Unit '{}' has no account/region and the project sets no default", unit.id),
                        format!("units[{i}]"),
                    )
                })?;
                Ok(DeployableUnit {
                    depends_on: unit.depends_on.clone(),
                    replace_on: unit.replace_on.clone(),
                    ..DeployableUnit::new(&unit.id, environment, unit.document.clone())
                })
            })
            .collect()
    }

    /// Builds the diff engine for this project.
    #[must_use]
    pub fn diff_engine(&self) -> DiffEngine {
        DiffEngine::new().with_replace_on(self.replace_on.iter().cloned())
    }
}

impl UnitConfig {
    /// Returns the unit's environment, falling back to the project defaults.
    #[must_use]
    pub fn environment(&self, project: &ProjectConfig) -> Option<EnvironmentKey> {
        let account = self.account.as_ref().or(project.account.as_ref())?;
        let region = self.region.as_ref().or(project.region.as_ref())?;
        Some(EnvironmentKey::new(account.as_str(), region.as_str()))
    }
}

impl OrchestratorConfig {
    /// Converts the run defaults to orchestrator options.
    #[must_use]
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            concurrency_limit: self.concurrency_limit,
            rollback_on_failure: self.rollback_on_failure,
            dry_run: false,
            retry: self.retry.policy(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..ApplyOptions::default()
        }
    }
}

impl RetryConfig {
    /// Converts the settings to a retry policy.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project(account: Option<&str>, region: Option<&str>) -> ProjectConfig {
        ProjectConfig {
            name: String::from("shop"),
            account: account.map(String::from),
            region: region.map(String::from),
        }
    }

    fn unit(id: &str) -> UnitConfig {
        UnitConfig {
            id: id.to_string(),
            account: None,
            region: None,
            depends_on: Vec::new(),
            replace_on: Vec::new(),
            document: json!({}),
        }
    }

    #[test]
    fn test_environment_falls_back_to_project() {
        let defaults = project(Some("111"), Some("eu-west-1"));

        let inherited = unit("network");
        assert_eq!(
            inherited.environment(&defaults),
            Some(EnvironmentKey::new("111", "eu-west-1"))
        );

        let overridden = UnitConfig {
            region: Some(String::from("us-east-1")),
            ..unit("dns")
        };
        assert_eq!(
            overridden.environment(&defaults),
            Some(EnvironmentKey::new("111", "us-east-1"))
        );

        assert_eq!(unit("app").environment(&project(Some("111"), None)), None);
    }

    #[test]
    fn test_retry_policy_conversion() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy, RetryPolicy::default());

        let options = OrchestratorConfig::default().apply_options();
        assert_eq!(options.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
        assert!(options.rollback_on_failure);
        assert!(!options.dry_run);
    }
}
