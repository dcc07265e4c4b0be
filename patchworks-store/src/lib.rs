//! The object store that patch resources, sources and targets live in.
//!
//! The engine only talks to the [`ObjectStore`] trait. Writes are guarded by
//! the object's `metadata.resourceVersion`: a write based on a stale read
//! fails with [`StoreError::Conflict`] instead of overwriting a concurrent
//! change.

pub mod file;
pub mod journal;
pub mod memory;

use async_trait::async_trait;
use patchworks_core::{CoreError, Object, ObjectKey};
use serde_json::Value;
use tokio::sync::broadcast;

pub use file::FileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(ObjectKey),
    #[error("{0} already exists")]
    AlreadyExists(ObjectKey),
    #[error("conflict writing {key}: the object has been modified (expected resourceVersion {expected}, found {actual})")]
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },
    #[error("invalid write: {0}")]
    Invalid(String),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Journal(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A change observed by [`ObjectStore::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
}

impl WatchEvent {
    pub fn object(&self) -> &Object {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Object>;

    /// Lists objects of one kind, optionally restricted to a namespace.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Object>>;

    async fn create(&self, object: Object) -> Result<Object>;

    /// Replaces the whole object.
    ///
    /// If the object carries a `resourceVersion` it must match the stored one.
    async fn update(&self, object: Object) -> Result<Object>;

    /// Merges a partial document into the stored object (RFC 7386).
    ///
    /// A `metadata.resourceVersion` in the patch is a precondition, not a
    /// value to write.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object>;

    /// Requests deletion. Objects with finalizers are only marked with a
    /// `deletionTimestamp` and returned; others are removed and `None` is
    /// returned.
    async fn delete(&self, key: &ObjectKey) -> Result<Option<Object>>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;

    /// Picks up changes other processes made to shared storage and reports
    /// them to watchers. Stores without outside writers have nothing to do.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}
