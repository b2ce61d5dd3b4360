//! Run-level locking.
//!
//! Per-record write serialization happens inside each store. This lock sits
//! above that: it keeps two processes from driving runs against the same
//! state location at the same time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::store::StateStore;
use crate::error::Result;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 900; // 15 minutes

/// Information about a held run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Pushes the expiry a full lock lifetime past now.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + chrono::Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// A held run lock. Release it explicitly with [`RunLock::release`].
#[derive(Debug)]
pub struct RunLock<'a, S: StateStore + ?Sized> {
    store: &'a S,
    info: LockInfo,
}

impl<'a, S: StateStore + ?Sized> RunLock<'a, S> {
    /// Acquires the run lock on `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if another live holder owns the lock.
    pub async fn acquire(store: &'a S, holder: Option<&str>) -> Result<Self> {
        let holder = holder.map_or_else(generate_holder_id, str::to_string);
        let info = store.acquire_lock(&holder).await?;
        Ok(Self { store, info })
    }

    /// Returns the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Renews the lock so it outlives a long run.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockLost`](crate::error::StateError::LockLost)
    /// if the lock expired and someone else took it, or a storage error.
    pub async fn refresh(&mut self) -> Result<()> {
        self.info = self.store.refresh_lock(&self.info.lock_id).await?;
        debug!("Renewed run lock {} until {}", self.info.lock_id, self.info.expires_at);
        Ok(())
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot delete the lock.
    pub async fn release(self) -> Result<()> {
        if self.info.is_expired() {
            warn!("Run lock {} expired before release", self.info.lock_id);
        }
        self.store.release_lock(&self.info.lock_id).await
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}
