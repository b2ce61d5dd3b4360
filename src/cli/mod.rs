//! Command-line interface for Stackwright.
//!
//! This module provides the argument definitions and the formatters used
//! to render plans, run reports and stored state.

mod commands;
mod output;

pub use commands::{
    Cli, Commands, ContextCommands, ContextKeyArgs, ModeArg, OutputFormat, RunArgs, StateCommands,
};
pub use output::OutputFormatter;
