//! Deployment plan types.
//!
//! A plan is the read-only preview of a run: the resolved order plus the
//! change set each unit would submit, or the error that would stop it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorClass;
use crate::orchestrator::ApplyMode;
use crate::unit::EnvironmentKey;

use super::diff::ChangeSet;

/// A complete deployment plan.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Mode the plan previews.
    pub mode: ApplyMode,
    /// Units in the order they would be processed.
    pub units: Vec<PlannedUnit>,
}

/// The preview for one unit.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedUnit {
    /// Unit identifier.
    pub unit_id: String,
    /// Target environment.
    pub environment: EnvironmentKey,
    /// What the unit would do.
    pub preview: UnitPreview,
}

/// Outcome of previewing one unit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitPreview {
    /// The change set the unit would submit.
    Changes {
        /// The computed change set.
        change_set: ChangeSet,
    },
    /// The unit cannot be diffed.
    Error {
        /// Error classification.
        class: ErrorClass,
        /// Error message.
        message: String,
    },
}

impl DeploymentPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(mode: ApplyMode) -> Self {
        Self {
            created_at: Utc::now(),
            mode,
            units: Vec::new(),
        }
    }

    /// Returns the unit ids in processing order.
    #[must_use]
    pub fn order(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.unit_id.as_str()).collect()
    }

    /// Returns the preview of a unit.
    #[must_use]
    pub fn get(&self, unit_id: &str) -> Option<&PlannedUnit> {
        self.units.iter().find(|u| u.unit_id == unit_id)
    }

    /// Returns true if no unit has anything to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.iter().all(|u| match &u.preview {
            UnitPreview::Changes { change_set } => change_set.is_empty(),
            UnitPreview::Error { .. } => false,
        })
    }

    /// Returns the number of units with changes.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(&u.preview, UnitPreview::Changes { change_set } if !change_set.is_empty()))
            .count()
    }

    /// Returns the number of units that could not be previewed.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.units
            .iter()
            .filter(|u| matches!(u.preview, UnitPreview::Error { .. }))
            .count()
    }
}

impl PlannedUnit {
    /// Returns the change set, if the unit could be diffed.
    #[must_use]
    pub const fn change_set(&self) -> Option<&ChangeSet> {
        match &self.preview {
            UnitPreview::Changes { change_set } => Some(change_set),
            UnitPreview::Error { .. } => None,
        }
    }
}

impl std::fmt::Display for PlannedUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.preview {
            UnitPreview::Changes { change_set } => write!(f, "{change_set}"),
            UnitPreview::Error { message, .. } => write!(f, "{}: error ({message})", self.unit_id),
        }
    }
}

impl std::fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "{} plan ({} units):", self.mode, self.units.len())?;
        for (i, unit) in self.units.iter().enumerate() {
            writeln!(f, "  {}. {unit}", i + 1)?;
            if let Some(change_set) = unit.change_set() {
                for entry in &change_set.entries {
                    writeln!(f, "       {entry}")?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::DiffEngine;
    use crate::unit::DeployableUnit;
    use serde_json::json;

    fn planned(id: &str) -> PlannedUnit {
        let unit = DeployableUnit::new(id, EnvironmentKey::new("acct", "eu-west-1"), json!({"a": 1}));
        PlannedUnit {
            unit_id: id.to_string(),
            environment: unit.environment.clone(),
            preview: UnitPreview::Changes {
                change_set: DiffEngine::new().diff(&unit, None),
            },
        }
    }

    #[test]
    fn test_empty_plan() {
        let plan = DeploymentPlan::new(ApplyMode::Deploy);
        assert!(plan.is_empty());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_plan_counts() {
        let mut plan = DeploymentPlan::new(ApplyMode::Deploy);
        plan.units.push(planned("network"));
        plan.units.push(PlannedUnit {
            unit_id: String::from("app"),
            environment: EnvironmentKey::new("acct", "eu-west-1"),
            preview: UnitPreview::Error {
                class: ErrorClass::StateCorruption,
                message: String::from("bad record"),
            },
        });

        assert_eq!(plan.order(), vec!["network", "app"]);
        assert_eq!(plan.change_count(), 1);
        assert_eq!(plan.error_count(), 1);
        assert!(!plan.is_empty());
        assert!(plan.get("app").and_then(PlannedUnit::change_set).is_none());

        let rendered = plan.to_string();
        assert!(rendered.contains("network: create"));
        assert!(rendered.contains("app: error (bad record)"));
    }
}
