//! Reconciliation of expected resources against live state.
//!
//! For each expected resource: create it when absent, otherwise fold the
//! rendered document into the live one with [`deep_update`] and write back
//! only when something changed. Resources recorded from earlier passes but
//! no longer expected are deleted — either hard, or by soft-deleting
//! (writing `status.state: delete`) for API groups whose resources manage
//! their own teardown.

use tracing::{debug, info, warn};

use crate::errors::{OperonError, OperonResult};
use crate::merge::deep_update;
use crate::model::{OwnerReference, RawResource, Source};
use crate::store::{ResourceStore, StoreError};

/// API groups whose resources are soft-deleted: instead of removing the
/// object, the reconciler writes `status.state: delete` and lets the
/// resource's own controller tear it down.
pub const SOFT_DELETE_API_VERSIONS: [&str; 2] =
    ["workload.operon.io/v1alpha1", "bind.operon.io/v1alpha1"];

const SOFT_DELETE_ATTEMPTS: u32 = 3;

/// Partial-result contract for passes that delete: the resource list is
/// valid even when `first_error` is set, and failed deletions stay in the
/// list so the next pass retries them.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub resources: Vec<Source>,
    pub first_error: Option<OperonError>,
}

impl ReconcileOutcome {
    fn record(&mut self, error: OperonError) {
        if self.first_error.is_none() {
            self.first_error = Some(error);
        }
    }
}

enum DeleteDisposition {
    Triggered,
    AlreadyGone,
}

/// Stamp the lifecycle object as controller owner on every resource.
pub fn set_owner_references(
    owner: &OwnerReference,
    resources: &mut [RawResource],
) -> OperonResult<()> {
    for resource in resources {
        resource.set_owner_reference(owner)?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Reconciler;

impl Reconciler {
    pub fn new() -> Self {
        Self
    }

    /// Drive live state toward `expected`, then delete orphans recorded in
    /// `last_resources`. Create and update failures abort the pass; delete
    /// failures are collected into the outcome.
    ///
    /// With `force` set, existing resources are replaced wholesale instead
    /// of merged (identity bookkeeping is preserved).
    pub async fn reconcile(
        &self,
        store: &dyn ResourceStore,
        expected: &[RawResource],
        last_resources: &[Source],
        force: bool,
    ) -> OperonResult<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();

        for resource in expected {
            let key = resource.key();
            match store.get(&key).await {
                Err(StoreError::NotFound(_)) => {
                    store.create(resource).await?;
                    info!(resource = %key, "created resource");
                }
                Err(err) => return Err(err.into()),
                Ok(live) => {
                    if force {
                        let mut replacement = resource.clone();
                        replacement.set_resource_version(live.resource_version());
                        replacement.set_uid(live.uid());
                        store.update(&replacement).await?;
                        info!(resource = %key, "replaced resource");
                    } else {
                        let mut merged = live;
                        let changed = deep_update(merged.body_mut(), resource.body())?;
                        if changed {
                            store.update(&merged).await?;
                            info!(resource = %key, "updated resource");
                        } else {
                            debug!(resource = %key, "resource already up to date");
                        }
                    }
                }
            }
            outcome.resources.push(Source::of(resource));
        }

        for recorded in last_resources {
            if outcome.resources.contains(recorded) {
                continue;
            }
            match self.delete_resource(store, recorded).await {
                Ok(_) => {
                    info!(resource = %recorded, "deleted orphan resource");
                }
                Err(err) => {
                    warn!(resource = %recorded, error = %err, "failed to delete orphan resource");
                    outcome.resources.push(recorded.clone());
                    outcome.record(err);
                }
            }
        }

        Ok(outcome)
    }

    /// Delete every recorded resource (teardown path). Successfully
    /// triggered deletions stay in the outcome until a later pass observes
    /// them gone; already-gone resources drop out.
    pub async fn delete_resources(
        &self,
        store: &dyn ResourceStore,
        resources: &[Source],
    ) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for recorded in resources {
            match self.delete_resource(store, recorded).await {
                Ok(DeleteDisposition::Triggered) => {
                    debug!(resource = %recorded, "deletion triggered");
                    outcome.resources.push(recorded.clone());
                }
                Ok(DeleteDisposition::AlreadyGone) => {
                    debug!(resource = %recorded, "resource already gone");
                }
                Err(err) => {
                    warn!(resource = %recorded, error = %err, "failed to delete resource");
                    outcome.resources.push(recorded.clone());
                    outcome.record(err);
                }
            }
        }
        outcome
    }

    async fn delete_resource(
        &self,
        store: &dyn ResourceStore,
        recorded: &Source,
    ) -> OperonResult<DeleteDisposition> {
        let key = recorded.key();
        if SOFT_DELETE_API_VERSIONS.contains(&recorded.api_version.as_str()) {
            for _ in 0..SOFT_DELETE_ATTEMPTS {
                let mut live = match store.get(&key).await {
                    Ok(live) => live,
                    Err(StoreError::NotFound(_)) => return Ok(DeleteDisposition::AlreadyGone),
                    Err(err) => return Err(err.into()),
                };
                live.status_object_mut()?
                    .insert("state".into(), serde_json::Value::String("delete".into()));
                match store.update(&live).await {
                    Ok(_) => return Ok(DeleteDisposition::Triggered),
                    Err(StoreError::Conflict(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            return Err(StoreError::Conflict(key).into());
        }

        match store.delete(&key).await {
            Ok(()) => Ok(DeleteDisposition::Triggered),
            Err(StoreError::NotFound(_)) => Ok(DeleteDisposition::AlreadyGone),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn deployment(name: &str, replicas: u64) -> RawResource {
        RawResource::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"replicas": replicas}
        }))
        .unwrap()
    }

    // ---- create and merge ----

    #[tokio::test]
    async fn creates_missing_resources_once() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        let expected = vec![deployment("web", 1)];

        let outcome = reconciler.reconcile(&store, &expected, &[], false).await.unwrap();
        assert_eq!(outcome.resources.len(), 1);
        assert!(outcome.first_error.is_none());

        let live = store.get(&expected[0].key()).await.unwrap();
        let version = live.resource_version().to_owned();

        // Second pass observes no change and does not bump the version.
        reconciler.reconcile(&store, &expected, &[], false).await.unwrap();
        let live = store.get(&expected[0].key()).await.unwrap();
        assert_eq!(live.resource_version(), version);
    }

    #[tokio::test]
    async fn merge_preserves_unmentioned_fields() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        store.create(&deployment("web", 1)).await.unwrap();

        // Something else populated status and injected a default.
        let key = deployment("web", 1).key();
        let mut live = store.get(&key).await.unwrap();
        live.body_mut()["status"] = json!({"readyReplicas": 1});
        live.body_mut()["spec"]["strategy"] = json!("RollingUpdate");
        store.update(&live).await.unwrap();

        reconciler
            .reconcile(&store, &[deployment("web", 3)], &[], false)
            .await
            .unwrap();
        let live = store.get(&key).await.unwrap();
        assert_eq!(live.body()["spec"]["replicas"], json!(3));
        assert_eq!(live.body()["spec"]["strategy"], json!("RollingUpdate"));
        assert_eq!(live.body()["status"]["readyReplicas"], json!(1));
    }

    #[tokio::test]
    async fn force_replaces_wholesale() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        store.create(&deployment("web", 1)).await.unwrap();

        let key = deployment("web", 1).key();
        let mut live = store.get(&key).await.unwrap();
        live.body_mut()["spec"]["strategy"] = json!("RollingUpdate");
        store.update(&live).await.unwrap();

        reconciler
            .reconcile(&store, &[deployment("web", 3)], &[], true)
            .await
            .unwrap();
        let live = store.get(&key).await.unwrap();
        assert_eq!(live.body()["spec"]["replicas"], json!(3));
        // Wholesale replacement drops fields the render does not carry.
        assert!(live.body()["spec"].get("strategy").is_none());
        assert!(!live.uid().is_empty());
    }

    // ---- orphan deletion ----

    #[tokio::test]
    async fn orphans_are_deleted_and_excluded() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        store.create(&deployment("old", 1)).await.unwrap();

        let last = vec![Source::of(&deployment("old", 1))];
        let outcome = reconciler
            .reconcile(&store, &[deployment("new", 1)], &last, false)
            .await
            .unwrap();

        assert_eq!(outcome.resources.len(), 1);
        assert_eq!(outcome.resources[0].name, "new");
        assert!(outcome.first_error.is_none());
        assert!(matches!(
            store.get(&deployment("old", 1).key()).await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    struct DenyDelete(MemoryStore);

    #[async_trait]
    impl ResourceStore for DenyDelete {
        async fn get(&self, key: &crate::model::ResourceKey) -> StoreResult<RawResource> {
            self.0.get(key).await
        }
        async fn list(
            &self,
            api_version: &str,
            kind: &str,
            namespace: &str,
            label_selector: &BTreeMap<String, String>,
        ) -> StoreResult<Vec<RawResource>> {
            self.0.list(api_version, kind, namespace, label_selector).await
        }
        async fn create(&self, resource: &RawResource) -> StoreResult<RawResource> {
            self.0.create(resource).await
        }
        async fn update(&self, resource: &RawResource) -> StoreResult<RawResource> {
            self.0.update(resource).await
        }
        async fn delete(&self, _key: &crate::model::ResourceKey) -> StoreResult<()> {
            Err(StoreError::Internal("deletion refused".into()))
        }
    }

    #[tokio::test]
    async fn failed_orphan_deletion_keeps_resource_and_first_error() {
        let store = DenyDelete(MemoryStore::new());
        let reconciler = Reconciler::new();
        store.0.create(&deployment("old", 1)).await.unwrap();

        let last = vec![Source::of(&deployment("old", 1))];
        let outcome = reconciler
            .reconcile(&store, &[deployment("new", 1)], &last, false)
            .await
            .unwrap();

        assert_eq!(outcome.resources.len(), 2);
        assert!(outcome.resources.iter().any(|s| s.name == "old"));
        assert!(outcome.first_error.is_some());
    }

    // ---- teardown path ----

    #[tokio::test]
    async fn teardown_keeps_triggered_and_drops_gone() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();

        // "present" has a finalizer, so deletion only marks it.
        let mut present = deployment("present", 1);
        present.body_mut()["metadata"]["finalizers"] = json!(["guard"]);
        store.create(&present).await.unwrap();

        let recorded = vec![Source::of(&present), Source::of(&deployment("gone", 1))];
        let outcome = reconciler.delete_resources(&store, &recorded).await;

        assert!(outcome.first_error.is_none());
        assert_eq!(outcome.resources.len(), 1);
        assert_eq!(outcome.resources[0].name, "present");
    }

    #[tokio::test]
    async fn soft_delete_marks_state_instead_of_removing() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        let managed = RawResource::from_value(json!({
            "apiVersion": "workload.operon.io/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "w1", "namespace": "default"},
        }))
        .unwrap();
        store.create(&managed).await.unwrap();

        let outcome = reconciler
            .delete_resources(&store, &[Source::of(&managed)])
            .await;
        assert!(outcome.first_error.is_none());
        assert_eq!(outcome.resources.len(), 1);

        let live = store.get(&managed.key()).await.unwrap();
        assert_eq!(live.body()["status"]["state"], json!("delete"));
    }

    #[tokio::test]
    async fn soft_delete_of_missing_resource_is_already_gone() {
        let store = MemoryStore::new();
        let reconciler = Reconciler::new();
        let recorded = Source {
            api_version: "bind.operon.io/v1alpha1".into(),
            kind: "Bind".into(),
            name: "b1".into(),
            namespace: "default".into(),
        };
        let outcome = reconciler.delete_resources(&store, &[recorded]).await;
        assert!(outcome.resources.is_empty());
        assert!(outcome.first_error.is_none());
    }

    // ---- owner references ----

    #[tokio::test]
    async fn owner_references_are_stamped_on_all() {
        let owner = OwnerReference {
            api_version: "osb.operon.io/v1alpha1".into(),
            kind: "ServiceInstance".into(),
            name: "i1".into(),
            uid: "uid-1".into(),
            controller: true,
        };
        let mut resources = vec![deployment("a", 1), deployment("b", 1)];
        set_owner_references(&owner, &mut resources).unwrap();
        for resource in &resources {
            assert_eq!(
                resource.body()["metadata"]["ownerReferences"][0]["uid"],
                json!("uid-1")
            );
        }
    }
}
