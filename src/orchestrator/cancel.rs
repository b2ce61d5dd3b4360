//! Cooperative run cancellation.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation flag backed by a `watch` channel.
///
/// Cancelling stops units from entering `Diffing` or `Submitting`; units
/// already `InProgress` keep polling until the backend reports a terminal
/// state. A signal raised between runs applies to the next one. The
/// orchestrator resets it whenever a run finishes.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Triggers cancellation.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Clears the flag so the signal can serve another run.
    pub fn reset(&self) {
        self.sender.send_replace(false);
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}
