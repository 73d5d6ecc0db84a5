//! In-memory [`ResourceStore`] used by tests and embedded deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::{RawResource, ResourceKey};
use crate::store::{ClusterRegistry, ResourceStore, StoreError, StoreResult};

/// Concurrent map of resources keyed by full identity, with monotonically
/// increasing resource versions and finalizer-aware deletion.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<ResourceKey, RawResource>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn next_version(&self) -> String {
        self.version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn validate(resource: &RawResource) -> StoreResult<()> {
        let key = resource.key();
        if key.name.is_empty() || key.kind.is_empty() || key.api_version.is_empty() {
            return Err(StoreError::MalformedRequest {
                key,
                message: "apiVersion, kind and metadata.name are required".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, key: &ResourceKey) -> StoreResult<RawResource> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        label_selector: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<RawResource>> {
        let mut matches: Vec<RawResource> = self
            .objects
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.api_version == api_version && key.kind == kind && key.namespace == namespace
            })
            .filter(|entry| {
                label_selector.iter().all(|(name, value)| {
                    entry.value().label(name).is_some_and(|found| found == value)
                })
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(matches)
    }

    async fn create(&self, resource: &RawResource) -> StoreResult<RawResource> {
        Self::validate(resource)?;
        let key = resource.key();
        if self.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let mut stored = resource.clone();
        stored.set_uid(&Uuid::new_v4().to_string());
        stored.set_resource_version(&self.next_version());
        self.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, resource: &RawResource) -> StoreResult<RawResource> {
        Self::validate(resource)?;
        let key = resource.key();
        let Some(current) = self.objects.get(&key).map(|entry| entry.value().clone()) else {
            return Err(StoreError::NotFound(key));
        };

        let incoming_version = resource.resource_version();
        if !incoming_version.is_empty() && incoming_version != current.resource_version() {
            return Err(StoreError::Conflict(key));
        }

        let mut stored = resource.clone();
        if stored.uid().is_empty() {
            stored.set_uid(current.uid());
        }
        // A deletion timestamp, once set, sticks until the object is gone.
        if stored.deletion_timestamp().is_none() {
            if let Some(stamp) = current.deletion_timestamp() {
                let stamp = stamp.to_owned();
                stored.set_deletion_timestamp(&stamp);
            }
        }
        stored.set_resource_version(&self.next_version());

        // Finalizer release on a deleting object completes the deletion.
        if stored.deletion_timestamp().is_some() && stored.finalizers().is_empty() {
            self.objects.remove(&key);
            return Ok(stored);
        }

        self.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, key: &ResourceKey) -> StoreResult<()> {
        let Some(current) = self.objects.get(key).map(|entry| entry.value().clone()) else {
            return Err(StoreError::NotFound(key.clone()));
        };

        if current.finalizers().is_empty() {
            self.objects.remove(key);
            return Ok(());
        }

        if current.deletion_timestamp().is_none() {
            let mut marked = current;
            marked.set_deletion_timestamp(
                &Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );
            marked.set_resource_version(&self.next_version());
            self.objects.insert(key.clone(), marked);
        }
        Ok(())
    }
}

/// Fixed cluster-id to store mapping.
#[derive(Default)]
pub struct StaticRegistry {
    clusters: DashMap<String, Arc<dyn ResourceStore>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster_id: impl Into<String>, store: Arc<dyn ResourceStore>) {
        self.clusters.insert(cluster_id.into(), store);
    }
}

impl ClusterRegistry for StaticRegistry {
    fn client_for(&self, cluster_id: &str) -> StoreResult<Arc<dyn ResourceStore>> {
        self.clusters
            .get(cluster_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::UnknownCluster(cluster_id.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(name: &str) -> RawResource {
        RawResource::new("apps/v1", "Deployment", "default", name)
    }

    // ---- basic crud ----

    #[tokio::test]
    async fn create_assigns_identity_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&resource("web")).await.unwrap();
        assert!(!created.uid().is_empty());
        assert!(!created.resource_version().is_empty());

        let err = store.create(&resource("web")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn get_returns_not_found_for_missing() {
        let store = MemoryStore::new();
        let err = store.get(&resource("web").key()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_requires_identity_fields() {
        let store = MemoryStore::new();
        let blank = RawResource::from_value(json!({"metadata": {}})).unwrap();
        let err = store.create(&blank).await.unwrap_err();
        assert!(matches!(err, StoreError::MalformedRequest { .. }));
    }

    // ---- optimistic concurrency ----

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&resource("web")).await.unwrap();

        let mut first = created.clone();
        first
            .status_object_mut()
            .unwrap()
            .insert("state".into(), json!("ready"));
        store.update(&first).await.unwrap();

        // Second writer still holds the original version.
        let err = store.update(&created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_without_version_wins() {
        let store = MemoryStore::new();
        store.create(&resource("web")).await.unwrap();
        let blind = resource("web");
        let updated = store.update(&blind).await.unwrap();
        assert!(!updated.resource_version().is_empty());
        assert!(!updated.uid().is_empty());
    }

    // ---- finalizer-aware deletion ----

    #[tokio::test]
    async fn delete_without_finalizers_removes() {
        let store = MemoryStore::new();
        store.create(&resource("web")).await.unwrap();
        store.delete(&resource("web").key()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn delete_with_finalizers_marks_and_waits() {
        let store = MemoryStore::new();
        let mut guarded = resource("web");
        guarded.body_mut()["metadata"]["finalizers"] = json!(["operon.io/lifecycle"]);
        store.create(&guarded).await.unwrap();

        store.delete(&guarded.key()).await.unwrap();
        let live = store.get(&guarded.key()).await.unwrap();
        assert!(live.deletion_timestamp().is_some());

        // Releasing the finalizer completes the deletion.
        let mut released = live;
        released.body_mut()["metadata"]["finalizers"] = json!([]);
        store.update(&released).await.unwrap();
        assert!(matches!(
            store.get(&guarded.key()).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    // ---- listing ----

    #[tokio::test]
    async fn list_filters_by_identity_and_labels() {
        let store = MemoryStore::new();
        let mut labeled = resource("web");
        labeled.body_mut()["metadata"]["labels"] = json!({"tier": "front"});
        store.create(&labeled).await.unwrap();
        store.create(&resource("db")).await.unwrap();
        store
            .create(&RawResource::new("v1", "Service", "default", "web"))
            .await
            .unwrap();

        let all = store
            .list("apps/v1", "Deployment", "default", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let selector = BTreeMap::from([("tier".to_owned(), "front".to_owned())]);
        let fronts = store
            .list("apps/v1", "Deployment", "default", &selector)
            .await
            .unwrap();
        assert_eq!(fronts.len(), 1);
        assert_eq!(fronts[0].name(), "web");
    }

    // ---- registry ----

    #[tokio::test]
    async fn registry_resolves_registered_clusters() {
        let registry = StaticRegistry::new();
        registry.register("1", Arc::new(MemoryStore::new()));
        assert!(registry.client_for("1").is_ok());
        assert!(matches!(
            registry.client_for("2").err().unwrap(),
            StoreError::UnknownCluster(_)
        ));
    }
}
