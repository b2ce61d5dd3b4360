// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwright
//!
//! A dependency-ordered deployment orchestrator for units of infrastructure
//! spread across accounts and regions.
//!
//! ## Overview
//!
//! Stackwright converges a set of declaratively described units to their
//! desired documents:
//!
//! - Units declare what they depend on, explicitly or through `${unit.output}`
//!   references in their documents
//! - Each run diffs desired documents against recorded state and submits only
//!   what changed to a provisioning backend
//! - Independent units run in parallel, up to a concurrency limit
//! - A failed unit blocks its dependents and nothing else
//! - Environment facts (`${context:provider?key=value}`) are resolved once and
//!   cached so later runs are deterministic
//!
//! ## Modules
//!
//! - [`unit`]: Deployable units, environments and lifecycle states
//! - [`graph`]: Dependency graph construction and ordering
//! - [`planner`]: Change sets, document references and plan previews
//! - [`state`]: State storage backends (local, S3) and the context cache
//! - [`backend`]: Provisioning backend contract and HTTP client
//! - [`orchestrator`]: Concurrent run driver
//! - [`config`]: Project file parsing and validation
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   account: "123456789012"
//!   region: eu-west-1
//!
//! backend:
//!   url: https://provisioner.internal
//!
//! units:
//!   - id: network
//!     document:
//!       type: vpc
//!       cidr: 10.0.0.0/16
//!   - id: app
//!     document:
//!       type: service
//!       vpc: "${network.vpc_id}"
//!       zones: "${context:availability-zones}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod planner;
pub mod state;
pub mod unit;

// ============================================================================
// Re-exports
// ============================================================================

pub use backend::{ContextResolver, HttpBackend, ProvisioningBackend};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, DocumentHasher, StackConfig};
pub use error::{Result, StackwrightError};
pub use graph::DependencyGraph;
pub use orchestrator::{ApplyMode, ApplyOptions, Orchestrator, RunReport};
pub use planner::{ChangeSet, DeploymentPlan, DiffEngine};
pub use state::{ContextCache, LocalStateStore, RecordedState, S3StateStore, StateStore};
pub use unit::{DeployableUnit, EnvironmentKey, UnitState};
