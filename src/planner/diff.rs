//! Diff engine for comparing desired vs recorded state.
//!
//! This module computes the structural difference between a unit's desired
//! document and the document recorded after its last successful apply. The
//! engine performs no I/O; deferred values are substituted beforehand with
//! [`DiffEngine::resolve_document`].

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::DocumentHasher;
use crate::error::ValidationError;
use crate::state::RecordedState;
use crate::unit::{DeployableUnit, EnvironmentKey};

use super::reference::{child_path, is_token, scan, substitute, Reference};

/// Paths whose modification always forces replacement.
pub const DEFAULT_REPLACE_ON: &[&str] = &["/type", "/name"];

/// Engine for computing change sets.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    /// Replacement patterns applied to every unit.
    replace_on: Vec<String>,
    /// Document hasher.
    hasher: DocumentHasher,
}

/// What a change set does to the unit as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// The unit has no recorded state yet.
    Create,
    /// The unit exists and its document changes.
    Update,
    /// The unit is torn down.
    Destroy,
    /// The unit is converged back to its recorded document.
    Rollback,
}

/// Classification of a single changed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeAction {
    /// The path is new.
    Add,
    /// The value at the path changes.
    Modify {
        /// The change cannot be applied in place.
        replace: bool,
    },
    /// The path goes away.
    Remove,
}

/// One changed path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEntry {
    /// Pointer-style path, empty for the document root.
    pub path: String,
    /// What happens at the path.
    pub action: ChangeAction,
    /// Value before the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    /// Value after the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

/// The difference between desired and recorded state of one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Unit identifier.
    pub unit_id: String,
    /// Target environment.
    pub environment: EnvironmentKey,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Changed paths, in document order.
    pub entries: Vec<ChangeEntry>,
    /// Paths holding values only known at execution time.
    pub unresolved: Vec<String>,
    /// Document the backend should converge to; null for teardown.
    pub document: Value,
    /// Fingerprint of `document`.
    pub fingerprint: String,
    /// Revision of the record this change set was computed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_revision: Option<u64>,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffEngine {
    /// Creates a diff engine with the default replacement patterns.
    #[must_use]
    pub fn new() -> Self {
        Self {
            replace_on: DEFAULT_REPLACE_ON.iter().map(|p| (*p).to_string()).collect(),
            hasher: DocumentHasher::new(),
        }
    }

    /// Adds engine-wide replacement patterns.
    #[must_use]
    pub fn with_replace_on<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replace_on.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Returns the engine-wide replacement patterns.
    #[must_use]
    pub fn replace_on(&self) -> &[String] {
        &self.replace_on
    }

    /// Computes the change set turning `recorded` into the unit's document.
    #[must_use]
    pub fn diff(&self, unit: &DeployableUnit, recorded: Option<&RecordedState>) -> ChangeSet {
        let patterns = self.patterns_for(unit);
        let mut walk = Walk::new(&patterns);

        let kind = match recorded {
            None => {
                walk.add("", &unit.document);
                ChangeKind::Create
            }
            Some(record) => {
                walk.compare(&record.document, &unit.document, "");
                ChangeKind::Update
            }
        };

        debug!(
            "Diffed {} in {}: {} entries, {} unresolved",
            unit.id,
            unit.environment,
            walk.entries.len(),
            walk.unresolved.len()
        );

        ChangeSet {
            unit_id: unit.id.clone(),
            environment: unit.environment.clone(),
            kind,
            entries: walk.entries,
            unresolved: walk.unresolved,
            document: unit.document.clone(),
            fingerprint: self.hasher.fingerprint(&unit.document),
            recorded_revision: recorded.map(|r| r.revision),
        }
    }

    /// Builds a change set of the given kind that does nothing.
    #[must_use]
    pub fn unchanged(&self, unit: &DeployableUnit, kind: ChangeKind) -> ChangeSet {
        ChangeSet {
            unit_id: unit.id.clone(),
            environment: unit.environment.clone(),
            kind,
            entries: Vec::new(),
            unresolved: Vec::new(),
            document: Value::Null,
            fingerprint: self.hasher.fingerprint(&Value::Null),
            recorded_revision: None,
        }
    }

    /// Computes the teardown change set of a unit.
    ///
    /// A unit without a record has nothing to tear down and gets an empty
    /// change set.
    #[must_use]
    pub fn destroy(&self, unit: &DeployableUnit, recorded: Option<&RecordedState>) -> ChangeSet {
        let mut change_set = self.unchanged(unit, ChangeKind::Destroy);
        if let Some(record) = recorded {
            change_set.entries.push(ChangeEntry {
                path: String::new(),
                action: ChangeAction::Remove,
                old_value: Some(record.document.clone()),
                new_value: None,
            });
            change_set.recorded_revision = Some(record.revision);
        }
        change_set
    }

    /// Computes the change set reverting the unit's document to `recorded`.
    ///
    /// Without a record the revert target is "nothing", so the change set
    /// removes whatever a partial create left behind.
    #[must_use]
    pub fn rollback(&self, unit: &DeployableUnit, recorded: Option<&RecordedState>) -> ChangeSet {
        let Some(record) = recorded else {
            let mut change_set = self.unchanged(unit, ChangeKind::Rollback);
            change_set.entries.push(ChangeEntry {
                path: String::new(),
                action: ChangeAction::Remove,
                old_value: Some(unit.document.clone()),
                new_value: None,
            });
            return change_set;
        };

        let patterns = self.patterns_for(unit);
        let mut walk = Walk::new(&patterns);
        walk.compare(&unit.document, &record.document, "");

        ChangeSet {
            unit_id: unit.id.clone(),
            environment: unit.environment.clone(),
            kind: ChangeKind::Rollback,
            entries: walk.entries,
            unresolved: walk.unresolved,
            document: record.document.clone(),
            fingerprint: self.hasher.fingerprint(&record.document),
            recorded_revision: Some(record.revision),
        }
    }

    /// Substitutes known deferred values in a document.
    ///
    /// `outputs` maps producer unit ids to their outputs; tokens referring to
    /// producers absent from the map stay in place. `context` maps context
    /// references to their values; unknown lookups stay in place as well.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingOutput`] if a producer is known but
    /// did not report the requested output.
    pub fn resolve_document(
        unit_id: &str,
        document: &Value,
        outputs: &BTreeMap<String, Map<String, Value>>,
        context: &BTreeMap<Reference, Value>,
    ) -> Result<Value, ValidationError> {
        substitute(document, &mut |reference: &Reference| match reference {
            Reference::Output { unit, output } => match outputs.get(unit) {
                Some(values) => values.get(output).cloned().map(Some).ok_or_else(|| {
                    ValidationError::MissingOutput {
                        unit: unit_id.to_string(),
                        producer: unit.clone(),
                        output: output.clone(),
                    }
                }),
                None => Ok(None),
            },
            Reference::Context { .. } => Ok(context.get(reference).cloned()),
        })
    }

    fn patterns_for<'a>(&'a self, unit: &'a DeployableUnit) -> Vec<&'a str> {
        self.replace_on
            .iter()
            .chain(unit.replace_on.iter())
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Accumulator for one structural comparison.
struct Walk<'a> {
    patterns: &'a [&'a str],
    entries: Vec<ChangeEntry>,
    unresolved: Vec<String>,
}

impl<'a> Walk<'a> {
    const fn new(patterns: &'a [&'a str]) -> Self {
        Self {
            patterns,
            entries: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    fn compare(&mut self, old: &Value, new: &Value, path: &str) {
        if is_token(new) {
            self.unresolved.push(path.to_string());
            return;
        }

        match (old, new) {
            (Value::Object(before), Value::Object(after)) => {
                let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
                for key in keys {
                    let child = child_path(path, key);
                    match (before.get(key), after.get(key)) {
                        (Some(b), Some(a)) => self.compare(b, a, &child),
                        (None, Some(a)) => self.add(&child, a),
                        (Some(b), None) => self.remove(&child, b),
                        (None, None) => {}
                    }
                }
            }
            (Value::Array(before), Value::Array(after)) => {
                for i in 0..before.len().max(after.len()) {
                    let child = child_path(path, &i.to_string());
                    match (before.get(i), after.get(i)) {
                        (Some(b), Some(a)) => self.compare(b, a, &child),
                        (None, Some(a)) => self.add(&child, a),
                        (Some(b), None) => self.remove(&child, b),
                        (None, None) => {}
                    }
                }
            }
            _ if old == new => {}
            _ => self.entries.push(ChangeEntry {
                path: path.to_string(),
                action: ChangeAction::Modify {
                    replace: requires_replacement(self.patterns, path),
                },
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
            }),
        }
    }

    fn add(&mut self, path: &str, value: &Value) {
        let mut tokens: Vec<String> = scan(value)
            .into_iter()
            .map(|(inner, _, _)| format!("{path}{inner}"))
            .collect();
        tokens.sort();
        self.unresolved.extend(tokens);

        self.entries.push(ChangeEntry {
            path: path.to_string(),
            action: ChangeAction::Add,
            old_value: None,
            new_value: Some(value.clone()),
        });
    }

    fn remove(&mut self, path: &str, value: &Value) {
        self.entries.push(ChangeEntry {
            path: path.to_string(),
            action: ChangeAction::Remove,
            old_value: Some(value.clone()),
            new_value: None,
        });
    }
}

/// Returns true if `path` equals or lies below one of `patterns`.
///
/// A `*` pattern segment matches exactly one path segment.
fn requires_replacement(patterns: &[&str], path: &str) -> bool {
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    patterns.iter().any(|pattern| {
        let pattern_segments: Vec<&str> = pattern.split('/').skip(1).collect();
        pattern_segments.len() <= segments.len()
            && pattern_segments
                .iter()
                .zip(&segments)
                .all(|(p, s)| *p == "*" || p == s)
    })
}

impl ChangeSet {
    /// Returns true if applying this change set would do nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.unresolved.is_empty()
    }

    /// Returns true if any entry forces resource replacement.
    #[must_use]
    pub fn requires_replacement(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.action, ChangeAction::Modify { replace: true }))
    }

    /// Counts entries as (adds, modifies, removes).
    #[must_use]
    pub fn counts(&self) -> (usize, usize, usize) {
        self.entries.iter().fold((0, 0, 0), |(a, m, r), e| match e.action {
            ChangeAction::Add => (a + 1, m, r),
            ChangeAction::Modify { .. } => (a, m + 1, r),
            ChangeAction::Remove => (a, m, r + 1),
        })
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Rollback => "rollback",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self.action {
            ChangeAction::Add => "+",
            ChangeAction::Modify { replace: false } => "~",
            ChangeAction::Modify { replace: true } => "-/+",
            ChangeAction::Remove => "-",
        };
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        write!(f, "{symbol} {path}")
    }
}

impl std::fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "{}: no changes", self.unit_id);
        }
        let (adds, modifies, removes) = self.counts();
        write!(
            f,
            "{}: {} (+{adds} ~{modifies} -{removes})",
            self.unit_id, self.kind
        )?;
        if !self.unresolved.is_empty() {
            write!(f, ", {} known after apply", self.unresolved.len())?;
        }
        Ok(())
    }
}
