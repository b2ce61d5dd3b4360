//! Project configuration.
//!
//! This module handles everything that comes from outside the process:
//! - Parsing `stackwright.yaml` and applying `STACKWRIGHT_*` overrides
//! - Validating the project before a run
//! - Fingerprinting documents for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::DocumentHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    BackendConfig, OrchestratorConfig, ProjectConfig, RetryConfig, StackConfig, StateBackend,
    StateConfig, UnitConfig,
};
pub use validator::{ConfigValidator, ValidationIssue, ValidationResult};
