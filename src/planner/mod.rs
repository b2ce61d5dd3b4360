//! Planning module for deployment operations.
//!
//! This module handles the comparison between desired and recorded states,
//! the deferred values embedded in documents, and plan previews.

mod diff;
mod plan;
pub mod reference;

pub use diff::{ChangeAction, ChangeEntry, ChangeKind, ChangeSet, DiffEngine, DEFAULT_REPLACE_ON};
pub use plan::{DeploymentPlan, PlannedUnit, UnitPreview};
pub use reference::{LocatedReference, Reference};
