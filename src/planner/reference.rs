//! Deferred values embedded in desired-state documents.
//!
//! Two token forms are recognised, each occupying an entire JSON string:
//!
//! - `${network.vpc_id}`: output `vpc_id` of unit `network`, known only once
//!   that unit has been applied in the current run (or a previous one).
//! - `${context:availability-zones?tier=public}`: an environment fact looked
//!   up through the context cache.
//!
//! Anything else is a literal.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix marking a context lookup token.
const CONTEXT_PREFIX: &str = "context:";

/// A parsed `${...}` token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// Output of another unit.
    Output {
        /// Producing unit.
        unit: String,
        /// Output name.
        output: String,
    },
    /// Context lookup.
    Context {
        /// Provider name, e.g. `availability-zones`.
        provider: String,
        /// Lookup parameters.
        params: BTreeMap<String, String>,
    },
}

/// A reference together with where it appears in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedReference {
    /// Pointer-style path of the string holding the token.
    pub path: String,
    /// The raw token text.
    pub token: String,
    /// The parsed reference.
    pub reference: Reference,
}

impl Reference {
    /// Parses a string value.
    ///
    /// Returns `None` if the string is not a token at all, and `Some(Err)`
    /// if it looks like a token but is malformed.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Result<Self, String>> {
        let inner = raw.strip_prefix("${")?.strip_suffix('}')?;

        if let Some(rest) = inner.strip_prefix(CONTEXT_PREFIX) {
            return Some(Self::parse_context(rest));
        }

        Some(match inner.split_once('.') {
            Some((unit, output)) if !unit.is_empty() && !output.is_empty() => Ok(Self::Output {
                unit: unit.to_string(),
                output: output.to_string(),
            }),
            _ => Err(String::from("expected '${unit.output}'")),
        })
    }

    fn parse_context(rest: &str) -> Result<Self, String> {
        let (provider, query) = rest.split_once('?').unwrap_or((rest, ""));
        if provider.is_empty() {
            return Err(String::from("context provider is empty"));
        }

        let mut params = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("parameter '{pair}' is not key=value"))?;
            if key.is_empty() {
                return Err(format!("parameter '{pair}' has an empty key"));
            }
            params.insert(key.to_string(), value.to_string());
        }

        Ok(Self::Context {
            provider: provider.to_string(),
            params,
        })
    }

    /// Returns the producing unit for output references.
    #[must_use]
    pub fn producer(&self) -> Option<&str> {
        match self {
            Self::Output { unit, .. } => Some(unit),
            Self::Context { .. } => None,
        }
    }
}

/// Returns true if the value is a `${...}` token (well-formed or not).
#[must_use]
pub fn is_token(value: &Value) -> bool {
    value.as_str().is_some_and(|s| Reference::parse(s).is_some())
}

/// Appends one segment to a pointer-style path.
#[must_use]
pub fn child_path(parent: &str, segment: &str) -> String {
    let escaped = segment.replace('~', "~0").replace('/', "~1");
    format!("{parent}/{escaped}")
}

/// Walks a document and collects every token, including malformed ones.
#[must_use]
pub fn scan(document: &Value) -> Vec<(String, String, Result<Reference, String>)> {
    let mut found = Vec::new();
    scan_into(document, "", &mut found);
    found
}

fn scan_into(value: &Value, path: &str, found: &mut Vec<(String, String, Result<Reference, String>)>) {
    match value {
        Value::String(s) => {
            if let Some(parsed) = Reference::parse(s) {
                found.push((path.to_string(), s.clone(), parsed));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                scan_into(item, &child_path(path, &i.to_string()), found);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                scan_into(item, &child_path(path, key), found);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Returns the well-formed references of a document.
#[must_use]
pub fn references(document: &Value) -> Vec<LocatedReference> {
    scan(document)
        .into_iter()
        .filter_map(|(path, token, parsed)| {
            parsed.ok().map(|reference| LocatedReference {
                path,
                token,
                reference,
            })
        })
        .collect()
}

/// Substitutes tokens in a document.
///
/// `lookup` returns `Ok(Some(value))` to replace a token, `Ok(None)` to leave
/// it in place as an unresolved value, or an error to abort.
///
/// # Errors
///
/// Propagates the first error returned by `lookup`.
pub fn substitute<E>(
    document: &Value,
    lookup: &mut impl FnMut(&Reference) -> Result<Option<Value>, E>,
) -> Result<Value, E> {
    match document {
        Value::String(s) => match Reference::parse(s) {
            Some(Ok(reference)) => Ok(lookup(&reference)?.unwrap_or_else(|| document.clone())),
            _ => Ok(document.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, lookup))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => Ok(document.clone()),
    }
}
