//! Local file-based state storage backend.
//!
//! Layout under the base directory:
//!
//! ```text
//! records/<account>/<region>/<unit>.json
//! context/<sha256 of key>.json
//! run.lock
//! ```
//!
//! Every write goes to a uniquely named temporary file which is synced and
//! then renamed over the target, so readers see either the old or the new
//! record and never a torn one.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DocumentHasher;
use crate::error::{Result, StackwrightError, StateError};
use crate::unit::EnvironmentKey;

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{decode_versioned, encode_component, ContextEntry, ContextKey, RecordedState};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwright";

/// Directory holding unit records.
const RECORDS_DIR: &str = "records";

/// Directory holding context entries.
const CONTEXT_DIR: &str = "context";

/// Lock file name.
const LOCK_FILE: &str = "run.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// One async mutex per storage key, serializing writers.
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Hasher for context file names.
    hasher: DocumentHasher,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.stackwright`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackwrightError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            lock_path,
            write_locks: Mutex::new(HashMap::new()),
            hasher: DocumentHasher::new(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, unit_id: &str, environment: &EnvironmentKey) -> PathBuf {
        self.base_dir
            .join(RECORDS_DIR)
            .join(encode_component(environment.account()))
            .join(encode_component(environment.region()))
            .join(format!("{}.json", encode_component(unit_id)))
    }

    fn context_path(&self, key: &ContextKey) -> PathBuf {
        self.base_dir
            .join(CONTEXT_DIR)
            .join(format!("{}.json", self.hasher.digest(&key.to_string())))
    }

    /// Returns the writer mutex for a storage key.
    fn write_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Reads and version-checks a JSON record.
    async fn read_versioned<T: DeserializeOwned>(path: &Path, key: &str) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(key, format!("Failed to read {}: {e}", path.display())).into());
            }
        };

        decode_versioned(&content, key).map(Some)
    }

    /// Writes a JSON record through a temp file and rename.
    async fn write_atomic<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StateError::storage(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        let temp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::storage(format!("Failed to create temp file: {e}"))
        })?;

        file.write_all(content.as_bytes()).await.map_err(|e| {
            StateError::storage(format!("Failed to write temp file: {e}"))
        })?;

        file.sync_all().await.map_err(|e| {
            StateError::storage(format!("Failed to sync temp file: {e}"))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StateError::storage(format!("Failed to rename {}: {e}", temp_path.display()))
        })?;

        Ok(())
    }

    /// Collects every `.json` file below `dir`.
    async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StateError::storage(format!("Failed to list {}: {e}", current.display())).into()),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StateError::storage(format!("Failed to list {}: {e}", current.display())))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StateError::storage(format!("Failed to stat {}: {e}", path.display())))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json") {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.lock_path).await {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                StateError::corrupted(LOCK_FILE, format!("Failed to parse lock file: {e}")).into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to read lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load_record(
        &self,
        unit_id: &str,
        environment: &EnvironmentKey,
    ) -> Result<Option<RecordedState>> {
        let path = self.record_path(unit_id, environment);
        debug!("Loading record from: {}", path.display());
        Self::read_versioned(&path, &format!("{environment}/{unit_id}")).await
    }

    async fn commit_record(&self, record: &RecordedState) -> Result<()> {
        let key = record.key();
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let path = self.record_path(&record.unit_id, &record.environment);
        Self::write_atomic(&path, record).await?;

        info!("Committed {key} at revision {}", record.revision);
        Ok(())
    }

    async fn remove_record(&self, unit_id: &str, environment: &EnvironmentKey) -> Result<()> {
        let key = format!("{environment}/{unit_id}");
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let path = self.record_path(unit_id, environment);
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed record {key}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::storage(format!("Failed to remove {}: {e}", path.display())).into()),
        }
    }

    async fn list_records(&self) -> Result<Vec<RecordedState>> {
        let mut records = Vec::new();
        for path in Self::json_files(&self.base_dir.join(RECORDS_DIR)).await? {
            let key = path.display().to_string();
            if let Some(record) = Self::read_versioned(&path, &key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn load_context(&self, key: &ContextKey) -> Result<Option<ContextEntry>> {
        Self::read_versioned(&self.context_path(key), &key.to_string()).await
    }

    async fn save_context(&self, entry: &ContextEntry) -> Result<()> {
        let key = entry.key.to_string();
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        Self::write_atomic(&self.context_path(&entry.key), entry).await?;
        debug!("Saved context entry {key}");
        Ok(())
    }

    async fn list_context(&self) -> Result<Vec<ContextEntry>> {
        let mut entries = Vec::new();
        for path in Self::json_files(&self.base_dir.join(CONTEXT_DIR)).await? {
            let key = path.display().to_string();
            if let Some(entry) = Self::read_versioned(&path, &key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let lock = self.write_lock(LOCK_FILE);
        let _guard = lock.lock().await;

        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(holder);
        Self::write_atomic(&self.lock_path, &lock_info).await?;

        info!(
            "Acquired run lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let lock = self.write_lock(LOCK_FILE);
        let _guard = lock.lock().await;

        let mut info = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }
                .into())
            }
        };
        info.refresh();
        Self::write_atomic(&self.lock_path, &info).await?;
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let lock = self.write_lock(LOCK_FILE);
        let _guard = lock.lock().await;

        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })?;
                info!("Released run lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
