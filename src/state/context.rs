//! Context cache for non-deterministic environment lookups.
//!
//! Facts such as "availability zones of region X" are resolved once, stored
//! in the state store and then treated as frozen: later runs read the stored
//! value and never silently re-resolve it. [`ContextCache::invalidate`] is the
//! only way to force a fresh resolution.
//!
//! Within a run, every key has a single [`OnceCell`] in the in-flight map, so
//! concurrent lookups of an unresolved key invoke the resolver once and all
//! share its result.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::backend::ContextResolver;
use crate::error::{ContextError, Result, StackwrightError};

use super::store::StateStore;
use super::types::{ContextEntry, ContextKey};

/// Run-scoped memo plus durable backing store for context entries.
pub struct ContextCache {
    store: Arc<dyn StateStore>,
    inflight: Mutex<HashMap<ContextKey, Arc<OnceCell<Value>>>>,
}

impl std::fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCache")
            .field("store", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl ContextCache {
    /// Creates a cache backed by `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, key: &ContextKey) -> Arc<OnceCell<Value>> {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(inflight.entry(key.clone()).or_default())
    }

    /// Looks a key up, asking `resolver` on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the resolver fails.
    pub async fn lookup(&self, key: &ContextKey, resolver: &dyn ContextResolver) -> Result<Value> {
        self.lookup_with(key, |k| async move { resolver.resolve(&k).await })
            .await
    }

    /// Looks a key up, invoking `resolve` on a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or `resolve` fails.
    pub async fn lookup_with<F, Fut>(&self, key: &ContextKey, resolve: F) -> Result<Value>
    where
        F: FnOnce(ContextKey) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let cell = self.cell(key);

        let value = cell
            .get_or_try_init(|| async {
                if let Some(entry) = self.store.load_context(key).await? {
                    if !entry.stale {
                        debug!("Context {key} served from store");
                        return Ok(entry.value);
                    }
                    debug!("Context {key} is stale, re-resolving");
                }

                info!("Resolving context {key}");
                let value = resolve(key.clone()).await.map_err(|e| ContextError::ResolutionFailed {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;

                self.store
                    .save_context(&ContextEntry::fresh(key.clone(), value.clone()))
                    .await?;
                Ok::<_, StackwrightError>(value)
            })
            .await?;

        Ok(value.clone())
    }

    /// Marks an entry stale so the next lookup re-resolves it.
    ///
    /// Returns `false` if there was nothing stored under the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn invalidate(&self, key: &ContextKey) -> Result<bool> {
        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inflight.remove(key);
        }

        match self.store.load_context(key).await? {
            Some(mut entry) => {
                entry.stale = true;
                self.store.save_context(&entry).await?;
                info!("Invalidated context {key}");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stores a value directly.
    ///
    /// A fresh entry is only replaced when `overwrite` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Frozen`] if a fresh entry exists and
    /// `overwrite` is false, or an error if the store fails.
    pub async fn put(&self, key: &ContextKey, value: Value, overwrite: bool) -> Result<()> {
        if let Some(existing) = self.store.load_context(key).await? {
            if !existing.stale && !overwrite {
                return Err(ContextError::Frozen {
                    key: key.to_string(),
                }
                .into());
            }
        }

        self.store
            .save_context(&ContextEntry::fresh(key.clone(), value.clone()))
            .await?;

        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inflight.insert(key.clone(), Arc::new(OnceCell::new_with(Some(value))));
        Ok(())
    }

    /// Lists every stored entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn entries(&self) -> Result<Vec<ContextEntry>> {
        self.store.list_context().await
    }

    /// Forgets the run-scoped memo. Stored entries are untouched.
    pub fn clear_run(&self) {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
