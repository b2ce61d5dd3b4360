//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for teams driving the same environments from several machines.
//! Object keys mirror the local layout under an optional prefix. S3 object
//! writes are atomic, so readers never observe a torn record.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::DocumentHasher;
use crate::error::{Result, StateError};
use crate::unit::EnvironmentKey;

use super::lock::{LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{decode_versioned, encode_component, ContextEntry, ContextKey, RecordedState};

/// Key prefix for unit records.
const RECORDS_PREFIX: &str = "records/";

/// Key prefix for context entries.
const CONTEXT_PREFIX: &str = "context/";

/// Lock object key suffix.
const LOCK_KEY: &str = "run.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// One async mutex per object key, serializing writers in this process.
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Hasher for context object names.
    hasher: DocumentHasher,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| {
                let p = p.trim_matches('/');
                if p.is_empty() {
                    String::new()
                } else {
                    format!("{p}/")
                }
            })
            .unwrap_or_default();

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
            write_locks: Mutex::new(HashMap::new()),
            hasher: DocumentHasher::new(),
        }
    }

    fn record_key(&self, unit_id: &str, environment: &EnvironmentKey) -> String {
        format!(
            "{}{RECORDS_PREFIX}{}/{}/{}.json",
            self.prefix,
            encode_component(environment.account()),
            encode_component(environment.region()),
            encode_component(unit_id)
        )
    }

    fn context_key(&self, key: &ContextKey) -> String {
        format!(
            "{}{CONTEXT_PREFIX}{}.json",
            self.prefix,
            self.hasher.digest(&key.to_string())
        )
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    fn write_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::storage(format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StateError::corrupted(key, format!("Invalid UTF-8 in S3 object: {e}"))
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::storage(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::storage(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::storage(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists object keys under a prefix, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::storage(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.ends_with(".json"))
                    .map(str::to_string),
            );

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;
        self.put_object(key, &content).await
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        let key = self.lock_key();
        match self.get_object(&key).await? {
            Some(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                StateError::corrupted(key, format!("Failed to parse lock: {e}")).into()
            }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load_record(
        &self,
        unit_id: &str,
        environment: &EnvironmentKey,
    ) -> Result<Option<RecordedState>> {
        let key = self.record_key(unit_id, environment);
        debug!("Loading record from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(content) => decode_versioned(&content, &key).map(Some),
            None => Ok(None),
        }
    }

    async fn commit_record(&self, record: &RecordedState) -> Result<()> {
        let key = self.record_key(&record.unit_id, &record.environment);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        self.put_json(&key, record).await?;
        info!(
            "Committed {} at revision {} to s3://{}/{key}",
            record.key(),
            record.revision,
            self.bucket
        );
        Ok(())
    }

    async fn remove_record(&self, unit_id: &str, environment: &EnvironmentKey) -> Result<()> {
        let key = self.record_key(unit_id, environment);
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        self.delete_object(&key).await?;
        info!("Removed record s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<RecordedState>> {
        let mut records = Vec::new();
        for key in self.list_keys(&format!("{}{RECORDS_PREFIX}", self.prefix)).await? {
            if let Some(content) = self.get_object(&key).await? {
                records.push(decode_versioned(&content, &key)?);
            }
        }
        Ok(records)
    }

    async fn load_context(&self, key: &ContextKey) -> Result<Option<ContextEntry>> {
        let object_key = self.context_key(key);
        match self.get_object(&object_key).await? {
            Some(content) => decode_versioned(&content, &key.to_string()).map(Some),
            None => Ok(None),
        }
    }

    async fn save_context(&self, entry: &ContextEntry) -> Result<()> {
        let object_key = self.context_key(&entry.key);
        let lock = self.write_lock(&object_key);
        let _guard = lock.lock().await;

        self.put_json(&object_key, entry).await
    }

    async fn list_context(&self) -> Result<Vec<ContextEntry>> {
        let mut entries = Vec::new();
        for key in self.list_keys(&format!("{}{CONTEXT_PREFIX}", self.prefix)).await? {
            if let Some(content) = self.get_object(&key).await? {
                entries.push(decode_versioned(&content, &key)?);
            }
        }
        Ok(entries)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock().await? {
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
        self.put_json(&self.lock_key(), &lock_info).await?;

        info!(
            "Acquired run lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn refresh_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut info = match self.read_lock().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => {
                return Err(StateError::LockLost {
                    lock_id: lock_id.to_string(),
                }
                .into())
            }
        };
        info.refresh();
        self.put_json(&self.lock_key(), &info).await?;
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.lock_key()).await?;
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
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
