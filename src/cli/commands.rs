//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::ApplyMode;

/// Stackwright - dependency-ordered deployment orchestration.
#[derive(Parser, Debug)]
#[command(name = "stackwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the project file.
    #[arg(short, long, global = true, env = "STACKWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "STACKWRIGHT_LOG_JSON")]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the project file.
    Validate {
        /// Show warnings too, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Preview the change sets of a run.
    Plan {
        /// Run mode to preview.
        #[arg(long, value_enum, default_value = "deploy")]
        mode: ModeArg,

        /// Show every changed path.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Deploy every unit, dependencies first.
    Apply(RunArgs),

    /// Tear every unit down, dependents first.
    Destroy(RunArgs),

    /// Converge every unit back to its recorded document, dependents first.
    Rollback(RunArgs),

    /// Show recorded state for the project's units.
    Status,

    /// Manage cached context entries.
    Context {
        /// Context subcommand.
        #[command(subcommand)]
        command: ContextCommands,
    },

    /// Manage the state store.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// Options shared by `apply`, `destroy` and `rollback`.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Skip the confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,

    /// Compute change sets without submitting them.
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum number of units driven at once.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Do not revert units whose deploy fails.
    #[arg(long)]
    pub no_rollback: bool,
}

/// Context cache subcommands.
#[derive(Subcommand, Debug)]
pub enum ContextCommands {
    /// List cached entries.
    List,

    /// Mark an entry stale so the next run re-resolves it.
    Invalidate(ContextKeyArgs),

    /// Seed an entry with a JSON value.
    Set {
        /// Entry key.
        #[command(flatten)]
        key: ContextKeyArgs,

        /// JSON value.
        value: String,

        /// Replace a fresh entry.
        #[arg(long)]
        overwrite: bool,
    },
}

/// Identifies a context entry.
#[derive(clap::Args, Debug, Clone)]
pub struct ContextKeyArgs {
    /// Provider name, e.g. `availability-zones`.
    pub provider: String,

    /// Account, defaults to the project's.
    #[arg(long)]
    pub account: Option<String>,

    /// Region, defaults to the project's.
    #[arg(long)]
    pub region: Option<String>,

    /// Lookup parameter as key=value, repeatable.
    #[arg(long = "param", value_parser = parse_param)]
    pub params: Vec<(String, String)>,
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the recorded state of a unit.
    Show {
        /// Unit identifier.
        unit: String,
    },

    /// Show the run lock.
    Lock,

    /// Release the run lock.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lock is held (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Run modes accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    /// Deploy.
    Deploy,
    /// Destroy.
    Destroy,
    /// Rollback.
    Rollback,
}

impl From<ModeArg> for ApplyMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Deploy => Self::Deploy,
            ModeArg::Destroy => Self::Destroy,
            ModeArg::Rollback => Self::Rollback,
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
