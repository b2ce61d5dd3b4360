//! Dependency graph resolution.
//!
//! This module builds the per-run DAG of deployable units and produces the
//! deployment order and its inverse for teardown.

mod handle;
mod resolver;

pub use handle::OutputHandle;
pub use resolver::{resolve, DependencyGraph, Edge, EdgeKind};
