//! Resource store abstraction.
//!
//! The orchestration core never talks to a concrete API server; it works
//! against the [`ResourceStore`] trait. Stores are expected to provide
//! optimistic concurrency (writes carrying a stale `resourceVersion` fail
//! with [`StoreError::Conflict`]) and finalizer-aware deletion (deleting an
//! object that still carries finalizers stamps a deletion timestamp instead
//! of removing it).

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{RawResource, ResourceKey};

pub use memory::{MemoryStore, StaticRegistry};

/// Failures surfaced by a resource store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource {0} not found")]
    NotFound(ResourceKey),

    #[error("resource {0} already exists")]
    AlreadyExists(ResourceKey),

    #[error("conflict writing resource {0}: resource version is stale")]
    Conflict(ResourceKey),

    /// Structurally invalid request. Never retried by the controllers.
    #[error("malformed request for resource {key}: {message}")]
    MalformedRequest { key: ResourceKey, message: String },

    #[error("cluster {0} is not registered")]
    UnknownCluster(String),

    #[error("store failure: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Asynchronous CRUD over loosely-typed resources.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> StoreResult<RawResource>;

    /// All resources of one kind in one namespace whose labels are a
    /// superset of `label_selector`.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<RawResource>>;

    /// Persist a new resource. The store assigns `uid` and
    /// `resourceVersion` and returns the stored form.
    async fn create(&self, resource: &RawResource) -> StoreResult<RawResource>;

    /// Replace an existing resource, honoring optimistic concurrency.
    async fn update(&self, resource: &RawResource) -> StoreResult<RawResource>;

    /// Delete a resource, honoring finalizers.
    async fn delete(&self, key: &ResourceKey) -> StoreResult<()>;
}

/// Maps cluster identifiers to their resource stores.
pub trait ClusterRegistry: Send + Sync {
    fn client_for(&self, cluster_id: &str) -> StoreResult<Arc<dyn ResourceStore>>;
}
