//! Project validation.
//!
//! Field rules come from the `validator` derive on the project types. The
//! checks here span fields: unit identity, dependencies, document shape,
//! reference syntax and state settings.

use crate::error::{ConfigError, Result};
use crate::planner::reference::{scan, Reference};
use reqwest::Url;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use super::spec::{StackConfig, StateBackend, StateConfig, UnitConfig};

/// Validator for project files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing every issue found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Problems that prevent a run.
    pub errors: Vec<ValidationIssue>,
    /// Non-fatal findings.
    pub warnings: Vec<String>,
}

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a project and returns every issue found.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(errors) = config.validate() {
            flatten("", &errors, &mut result.errors);
        }
        Self::validate_backend_url(&config.backend.url, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_patterns(&config.replace_on, "replace_on", &mut result);
        Self::validate_units(config, &mut result);

        result
    }

    /// Validates a project.
    ///
    /// # Errors
    ///
    /// Returns the first issue if any is found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        match result.errors.first() {
            None => {
                debug!("Project validation passed");
                Ok(result)
            }
            Some(first) => Err(ConfigError::validation(first.message.clone(), first.field.clone()).into()),
        }
    }

    fn validate_backend_url(url: &str, result: &mut ValidationResult) {
        if url.is_empty() {
            // Reported by the field rules.
            return;
        }
        match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                if parsed.scheme() == "http" && !matches!(parsed.host_str(), Some("localhost" | "127.0.0.1")) {
                    result
                        .warnings
                        .push(format!("backend.url: '{url}' is not using https; the token is sent in clear"));
                }
            }
            Ok(_) | Err(_) => result.errors.push(ValidationIssue {
                field: String::from("backend.url"),
                message: format!("Backend URL '{url}' must be an http(s) URL"),
            }),
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.errors.push(ValidationIssue {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path: ignored when using the S3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored when using the local backend"));
                }
            }
        }
    }

    fn validate_patterns(patterns: &[String], field: &str, result: &mut ValidationResult) {
        for (i, pattern) in patterns.iter().enumerate() {
            if !pattern.starts_with('/') {
                result.errors.push(ValidationIssue {
                    field: format!("{field}[{i}]"),
                    message: format!("Replacement pattern '{pattern}' must start with '/'"),
                });
            }
        }
    }

    fn validate_units(config: &StackConfig, result: &mut ValidationResult) {
        if config.units.is_empty() {
            result.warnings.push(String::from("No units defined in project"));
            return;
        }

        let known: HashSet<&str> = config.units.iter().map(|u| u.id.as_str()).collect();
        let mut seen = HashSet::new();

        for (i, unit) in config.units.iter().enumerate() {
            let prefix = format!("units[{i}]");

            if !seen.insert(unit.id.as_str()) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.id"),
                    message: format!("Duplicate unit id: {}", unit.id),
                });
            }

            if !unit.id.is_empty() && !is_valid_id(&unit.id) {
                result.errors.push(ValidationIssue {
                    field: format!("{prefix}.id"),
                    message: format!(
                        "Unit id '{}' is invalid. Use letters, digits, '-' and '_', starting with a letter.",
                        unit.id
                    ),
                });
            }

            if unit.environment(&config.project).is_none() {
                result.errors.push(ValidationIssue {
                    field: prefix.clone(),
                    message: format!(
                        "Unit '{}' has no account/region and the project sets no default",
                        unit.id
                    ),
                });
            }

            Self::validate_dependencies(unit, &prefix, &known, result);
            Self::validate_patterns(&unit.replace_on, &format!("{prefix}.replace_on"), result);
            Self::validate_document(unit, &prefix, &known, result);
        }
    }

    fn validate_dependencies(
        unit: &UnitConfig,
        prefix: &str,
        known: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        let mut seen = HashSet::new();
        for (j, dependency) in unit.depends_on.iter().enumerate() {
            let field = format!("{prefix}.depends_on[{j}]");
            if dependency == &unit.id {
                result.errors.push(ValidationIssue {
                    field,
                    message: format!("Unit '{}' depends on itself", unit.id),
                });
            } else if !known.contains(dependency.as_str()) {
                result.errors.push(ValidationIssue {
                    field,
                    message: format!("Unit '{}' depends on unknown unit '{dependency}'", unit.id),
                });
            } else if !seen.insert(dependency.as_str()) {
                result
                    .warnings
                    .push(format!("{field}: '{dependency}' is listed more than once"));
            }
        }
    }

    fn validate_document(
        unit: &UnitConfig,
        prefix: &str,
        known: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        if !unit.document.is_object() {
            result.errors.push(ValidationIssue {
                field: format!("{prefix}.document"),
                message: format!("Document of unit '{}' must be a mapping", unit.id),
            });
            return;
        }
        if unit.document.as_object().is_some_and(serde_json::Map::is_empty) {
            result
                .warnings
                .push(format!("{prefix}.document: unit '{}' declares an empty document", unit.id));
        }

        for (path, token, parsed) in scan(&unit.document) {
            let field = format!("{prefix}.document{path}");
            match parsed {
                Err(message) => result.errors.push(ValidationIssue {
                    field,
                    message: format!("Invalid reference '{token}': {message}"),
                }),
                Ok(Reference::Output { unit: producer, .. }) if producer == unit.id => {
                    result.errors.push(ValidationIssue {
                        field,
                        message: format!("Unit '{}' references its own output", unit.id),
                    });
                }
                Ok(Reference::Output { unit: producer, .. }) if !known.contains(producer.as_str()) => {
                    result.errors.push(ValidationIssue {
                        field,
                        message: format!("Reference '{token}' names unknown unit '{producer}'"),
                    });
                }
                Ok(_) => {}
            }
        }

        if let Value::Object(map) = &unit.document {
            if map.keys().any(|k| k.starts_with("${")) {
                result.warnings.push(format!(
                    "{prefix}.document: keys are never substituted, only string values"
                ));
            }
        }
    }
}

/// Flattens derive errors into dotted field paths, sorted for stable output.
fn flatten(prefix: &str, errors: &ValidationErrors, out: &mut Vec<ValidationIssue>) {
    let mut found = Vec::new();

    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };

        match kind {
            ValidationErrorsKind::Field(list) => {
                for error in list {
                    found.push(ValidationIssue {
                        field: path.clone(),
                        message: error
                            .message
                            .as_ref()
                            .map_or_else(|| format!("{path} is invalid ({})", error.code), ToString::to_string),
                    });
                }
            }
            ValidationErrorsKind::Struct(inner) => flatten(&path, inner, &mut found),
            ValidationErrorsKind::List(items) => {
                for (i, inner) in items {
                    flatten(&format!("{path}[{i}]"), inner, &mut found);
                }
            }
        }
    }

    found.sort_by(|a, b| a.field.cmp(&b.field));
    out.extend(found);
}

/// Unit ids appear in `${unit.output}` tokens, so they cannot contain dots.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> StackConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    const VALID: &str = r#"
project:
  name: shop
  account: "123456789012"
  region: eu-west-1
backend:
  url: https://provisioner.internal
units:
  - id: network
    document: {type: vpc, cidr: 10.0.0.0/16}
  - id: app
    document: {type: service, vpc: "${network.vpc_id}"}
"#;

    #[test]
    fn test_valid_project() {
        let result = ConfigValidator::new().check(&parse(VALID));
        assert!(result.is_valid(), "{:?}", result.errors);
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_valid_id() {
        assert!(is_valid_id("network"));
        assert!(is_valid_id("app_v2"));
        assert!(is_valid_id("Edge-Cache"));
        assert!(!is_valid_id("2fast"));
        assert!(!is_valid_id("app.v2"));
        assert!(!is_valid_id(""));
    }

    #[test]
    fn test_cross_field_errors() {
        let yaml = r#"
project:
  name: shop
backend:
  url: ftp://provisioner
state:
  backend: s3
units:
  - id: network
    account: "1"
    region: r
    document: {type: vpc}
  - id: network
    account: "1"
    region: r
    depends_on: [database]
    document: {vpc: "${dns.zone_id}"}
  - id: app
    document: [1, 2]
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"backend.url"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"units[1].id"));
        assert!(fields.contains(&"units[1].depends_on[0]"));
        assert!(fields.contains(&"units[1].document/vpc"));
        assert!(fields.contains(&"units[2]"));
        assert!(fields.contains(&"units[2].document"));
    }

    #[test]
    fn test_derive_rules_are_reported_with_paths() {
        let yaml = r#"
project:
  name: ""
  account: "1"
  region: r
backend:
  url: http://localhost:8080
orchestrator:
  concurrency_limit: 0
  retry:
    max_attempts: 0
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"project.name"));
        assert!(fields.contains(&"orchestrator.concurrency_limit"));
        assert!(fields.contains(&"orchestrator.retry.max_attempts"));
        assert!(result.warnings.iter().any(|w| w.contains("No units")));

        let err = ConfigValidator::new().validate(&parse(yaml)).expect_err("invalid");
        assert!(err.to_string().contains("cannot be empty") || err.to_string().contains("at least"));
    }

    #[test]
    fn test_malformed_reference_is_an_error() {
        let yaml = r#"
project: {name: shop, account: "1", region: r}
backend: {url: "https://provisioner.internal"}
units:
  - id: app
    document: {zones: "${context:}"}
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        assert_eq!(result.error_count(), 1);
        assert_eq!(result.errors[0].field, "units[0].document/zones");
    }
}
