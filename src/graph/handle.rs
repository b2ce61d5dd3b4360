//! Deferred unit outputs.

use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};

/// Write-once promise for the outputs of one unit.
///
/// The graph hands one clone to every implicit edge pointing at the
/// producer. The orchestrator fulfils it when the producer succeeds, and
/// dependents only read it after that point.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    producer: Arc<str>,
    outputs: Arc<OnceLock<Map<String, Value>>>,
}

impl OutputHandle {
    /// Creates an unfulfilled handle.
    #[must_use]
    pub fn new(producer: &str) -> Self {
        Self {
            producer: Arc::from(producer),
            outputs: Arc::new(OnceLock::new()),
        }
    }

    /// Returns the producing unit.
    #[must_use]
    pub fn producer(&self) -> &str {
        &self.producer
    }

    /// Stores the producer's outputs. Returns false if already fulfilled.
    pub fn fulfil(&self, outputs: Map<String, Value>) -> bool {
        self.outputs.set(outputs).is_ok()
    }

    /// Returns the outputs once fulfilled.
    #[must_use]
    pub fn get(&self) -> Option<&Map<String, Value>> {
        self.outputs.get()
    }

    /// Returns true once fulfilled.
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.outputs.get().is_some()
    }
}
