//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Implementations must serialize writes per record key and must never let
//! a reader observe a partially written record.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{ContextEntry, ContextKey, RecordedState};
use crate::error::Result;
use crate::unit::EnvironmentKey;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the recorded state of a unit.
    ///
    /// Returns `None` if the unit was never applied to this environment.
    async fn load_record(&self, unit_id: &str, environment: &EnvironmentKey)
        -> Result<Option<RecordedState>>;

    /// Atomically replaces the recorded state of a unit.
    async fn commit_record(&self, record: &RecordedState) -> Result<()>;

    /// Removes the recorded state of a unit.
    async fn remove_record(&self, unit_id: &str, environment: &EnvironmentKey) -> Result<()>;

    /// Lists every recorded state.
    async fn list_records(&self) -> Result<Vec<RecordedState>>;

    /// Loads a context entry.
    async fn load_context(&self, key: &ContextKey) -> Result<Option<ContextEntry>>;

    /// Atomically replaces a context entry.
    async fn save_context(&self, entry: &ContextEntry) -> Result<()>;

    /// Lists every context entry.
    async fn list_context(&self) -> Result<Vec<ContextEntry>>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Extends the run lock held under `lock_id`.
    ///
    /// Fails with [`StateError::LockLost`](crate::error::StateError::LockLost)
    /// if the lock is gone or now belongs to someone else.
    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Releases the run lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load_record(
        &self,
        unit_id: &str,
        environment: &EnvironmentKey,
    ) -> Result<Option<RecordedState>> {
        (**self).load_record(unit_id, environment).await
    }

    async fn commit_record(&self, record: &RecordedState) -> Result<()> {
        (**self).commit_record(record).await
    }

    async fn remove_record(&self, unit_id: &str, environment: &EnvironmentKey) -> Result<()> {
        (**self).remove_record(unit_id, environment).await
    }

    async fn list_records(&self) -> Result<Vec<RecordedState>> {
        (**self).list_records().await
    }

    async fn load_context(&self, key: &ContextKey) -> Result<Option<ContextEntry>> {
        (**self).load_context(key).await
    }

    async fn save_context(&self, entry: &ContextEntry) -> Result<()> {
        (**self).save_context(entry).await
    }

    async fn list_context(&self) -> Result<Vec<ContextEntry>> {
        (**self).list_context().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).refresh_lock(lock_id).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
