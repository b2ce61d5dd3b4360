//! Provisioning backend integration.
//!
//! The orchestrator talks to the outside world through two traits:
//! [`ProvisioningBackend`] applies change sets, and [`ContextResolver`]
//! answers environment lookups for the context cache. [`HttpBackend`]
//! implements both over a small JSON protocol.

mod http;
mod retry;
mod types;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::planner::ChangeSet;
use crate::state::ContextKey;

pub use http::{HttpBackend, TOKEN_ENV_VAR};
pub use retry::RetryPolicy;
pub use types::{BackendHandle, BackendStatus};

/// A declarative "apply this change set" service.
///
/// Submitting the same change set twice must be harmless.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Hands a change set to the backend.
    async fn submit(&self, change_set: &ChangeSet) -> Result<BackendHandle>;

    /// Reports the progress of a submitted change set.
    async fn poll(&self, handle: &BackendHandle) -> Result<BackendStatus>;
}

/// Resolves context lookups on a cache miss.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContextResolver: Send + Sync {
    /// Looks up the current value for a key.
    async fn resolve(&self, key: &ContextKey) -> Result<Value>;
}
