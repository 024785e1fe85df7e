//! Capsule kubehub: the backing-store contract the reconciliation pipeline
//! consumes, a kube-rs implementation, and an in-memory one.

#![forbid(unsafe_code)]

mod kube_store;
pub mod memory;
mod watch;

use capsule_core::{Capsule, ObjectKey};
use kube::core::DynamicObject;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;
pub use watch::start_capsule_watcher;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Kube(kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => match (resp.code, resp.reason.as_str()) {
                (404, _) => Self::NotFound(resp.message),
                (409, "AlreadyExists") => Self::AlreadyExists(resp.message),
                (409, _) => Self::Conflict(resp.message),
                (422, _) => Self::Invalid(resp.message),
                _ => Self::Kube(kube::Error::Api(resp)),
            },
            other => Self::Kube(other),
        }
    }
}

/// Minimum surface of the cluster API used by the pipeline. Every call is an
/// independent request; cancellation is dropping the future.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fails with [`StoreError::NotFound`] when absent.
    async fn get(&self, key: &ObjectKey) -> Result<DynamicObject, StoreError>;

    /// Returns the object as the server materialized it.
    async fn create(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError>;

    /// `obj` carries the resourceVersion it was based on.
    async fn update(&self, key: &ObjectKey, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject, StoreError>;

    /// Deletes exactly the instance described by `obj` (uid precondition).
    async fn delete(&self, key: &ObjectKey, obj: &DynamicObject) -> Result<(), StoreError>;

    /// Writes the status subresource; returns the stored Capsule.
    async fn update_capsule_status(&self, capsule: &Capsule) -> Result<Capsule, StoreError>;
}

/// `get` that maps NotFound to `None`.
pub async fn get_opt(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
    match store.get(key).await {
        Ok(o) => Ok(Some(o)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
