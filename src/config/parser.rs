//! Project file parser.
//!
//! This module loads `stackwright.yaml`, the optional `.env` file next to
//! it, and `STACKWRIGHT_*` environment overrides, in that order of
//! precedence (environment wins).

use crate::error::{ConfigError, Result, StackwrightError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{StackConfig, StateBackend};

/// Default project file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackwright.yaml", "stackwright.yml"];

/// Environment variables that override project file values.
const ENV_PROJECT_NAME: &str = "STACKWRIGHT_PROJECT_NAME";
const ENV_ACCOUNT: &str = "STACKWRIGHT_ACCOUNT";
const ENV_REGION: &str = "STACKWRIGHT_REGION";
const ENV_STATE_BACKEND: &str = "STACKWRIGHT_STATE_BACKEND";
const ENV_STATE_PATH: &str = "STACKWRIGHT_STATE_PATH";
const ENV_STATE_BUCKET: &str = "STACKWRIGHT_STATE_BUCKET";
const ENV_STATE_PREFIX: &str = "STACKWRIGHT_STATE_PREFIX";
const ENV_BACKEND_URL: &str = "STACKWRIGHT_BACKEND_URL";
const ENV_CONCURRENCY: &str = "STACKWRIGHT_CONCURRENCY";

/// Loader for project files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding the project file, used to find `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory used to find `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a project file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading project from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a project from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML project");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: source.map(|p| p.display().to_string()),
        })?;

        debug!(
            "Parsed project '{}' with {} units",
            config.project.name,
            config.units.len()
        );
        Ok(config)
    }

    /// Loads a project file and applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if an override has an invalid value.
    pub fn apply_overrides(
        config: &mut StackConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(name) = var(ENV_PROJECT_NAME) {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }
        if let Some(account) = var(ENV_ACCOUNT) {
            debug!("Overriding project.account from environment");
            config.project.account = Some(account);
        }
        if let Some(region) = var(ENV_REGION) {
            debug!("Overriding project.region from environment");
            config.project.region = Some(region);
        }

        if let Some(backend) = var(ENV_STATE_BACKEND) {
            debug!("Overriding state.backend from environment");
            config.state.backend = match backend.to_lowercase().as_str() {
                "local" => StateBackend::Local,
                "s3" => StateBackend::S3,
                other => {
                    return Err(ConfigError::validation(
                        format!("Invalid {ENV_STATE_BACKEND} '{other}', expected local or s3"),
                        "state.backend",
                    )
                    .into());
                }
            };
        }
        if let Some(path) = var(ENV_STATE_PATH) {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }
        if let Some(bucket) = var(ENV_STATE_BUCKET) {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }
        if let Some(prefix) = var(ENV_STATE_PREFIX) {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(url) = var(ENV_BACKEND_URL) {
            debug!("Overriding backend.url from environment");
            config.backend.url = url;
        }

        if let Some(limit) = var(ENV_CONCURRENCY) {
            debug!("Overriding orchestrator.concurrency_limit from environment");
            config.orchestrator.concurrency_limit = limit.trim().parse().map_err(|_| {
                ConfigError::validation(
                    format!("Invalid {ENV_CONCURRENCY} '{limit}', expected a positive integer"),
                    "orchestrator.concurrency_limit",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Finds the project file in `start_dir` or its parents.
///
/// # Errors
///
/// Returns an error if no project file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found project file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(StackwrightError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r"
project:
  name: shop
backend:
  url: http://localhost:8080
";

    #[test]
    fn test_parse_minimal_project() {
        let config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parse");

        assert_eq!(config.project.name, "shop");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.orchestrator.concurrency_limit, 4);
        assert!(config.orchestrator.rollback_on_failure);
        assert!(config.units.is_empty());
    }

    #[test]
    fn test_parse_full_project() {
        let yaml = r#"
project:
  name: shop
  account: "123456789012"
  region: eu-west-1

state:
  backend: s3
  bucket: shop-state
  prefix: shop/prod

backend:
  url: https://provisioner.internal
  timeout_secs: 10

orchestrator:
  concurrency_limit: 8
  rollback_on_failure: false
  retry:
    max_attempts: 3

replace_on:
  - /engine

units:
  - id: network
    document:
      type: vpc
      cidr: 10.0.0.0/16
  - id: app
    region: us-east-1
    depends_on: [network]
    document:
      type: service
      vpc: "${network.vpc_id}"
      zones: "${context:availability-zones?tier=public}"
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("shop-state"));
        assert_eq!(config.orchestrator.concurrency_limit, 8);
        assert_eq!(config.orchestrator.retry.max_attempts, 3);
        assert_eq!(config.orchestrator.retry.call_timeout_secs, 60);
        assert_eq!(config.unit_ids(), vec!["network", "app"]);

        let units = config.deployable_units().expect("units");
        assert_eq!(units[0].environment.region(), "eu-west-1");
        assert_eq!(units[1].environment.region(), "us-east-1");
        assert_eq!(units[1].depends_on, vec![String::from("network")]);
        assert_eq!(units[1].document["vpc"], "${network.vpc_id}");
        assert!(config.diff_engine().replace_on().iter().any(|p| p == "/engine"));
    }

    #[test]
    fn test_parse_error_names_source() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", Some(Path::new("stackwright.yaml")))
            .expect_err("invalid yaml");
        assert!(matches!(
            err,
            StackwrightError::Config(ConfigError::ParseError { location: Some(_), .. })
        ));
    }

    #[test]
    fn test_environment_overrides() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parse");
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_PROJECT_NAME, "shop-staging"),
            (ENV_STATE_BACKEND, "S3"),
            (ENV_STATE_BUCKET, "staging-state"),
            (ENV_CONCURRENCY, "2"),
            (ENV_BACKEND_URL, ""),
        ]);

        ConfigParser::apply_overrides(&mut config, |name| vars.get(name).map(ToString::to_string))
            .expect("overrides");

        assert_eq!(config.project.name, "shop-staging");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("staging-state"));
        assert_eq!(config.orchestrator.concurrency_limit, 2);
        // Empty values are ignored.
        assert_eq!(config.backend.url, "http://localhost:8080");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("parse");
        let result = ConfigParser::apply_overrides(&mut config, |name| {
            (name == ENV_CONCURRENCY).then(|| String::from("many"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("stacks").join("prod");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("stackwright.yaml"), MINIMAL).expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("stackwright.yaml"));
    }
}
