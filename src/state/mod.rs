//! State management for deployment runs.
//!
//! This module persists the last committed state of every unit per
//! environment, the context cache entries, and the run lock.

mod context;
mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use context::ContextCache;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, RunLock, LOCK_EXPIRY_SECS};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{ContextEntry, ContextKey, RecordedState, STATE_VERSION};
