//! Service binding lifecycle controller.
//!
//! Bindings follow the same state machine as instances, with two twists:
//! a successful bind materializes a credentials secret (recorded in
//! `status.response.secretRef`), and a binding whose service instance has
//! disappeared is an orphan that deletes itself.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::OperonConfig;
use crate::controller::{
    error_count, needed_watches, with_retries, WatchReporter, ERROR_COUNT_LABEL, FINALIZER,
    LAST_OPERATION_LABEL, OWN_CLUSTER_ID,
};
use crate::errors::{OperonError, OperonResult};
use crate::materialize::{MaterializeRequest, Materializer};
use crate::model::{
    Action, ActionStatus, LifecycleState, ObjectKey, RawResource, ResourceKey, ServiceBinding,
    ServiceInstance, Source,
};
use crate::reconcile::{set_owner_references, Reconciler};
use crate::store::{ClusterRegistry, ResourceStore, StoreError};

/// Prefix of the credentials secret created for a successful bind.
pub const CREDENTIALS_SECRET_PREFIX: &str = "creds-";

fn resource_key(key: &ObjectKey) -> ResourceKey {
    ServiceBinding::resource_key(&key.namespace, &key.name)
}

fn secret_key(key: &ObjectKey) -> ResourceKey {
    ResourceKey::new(
        "v1",
        "Secret",
        &key.namespace,
        format!("{CREDENTIALS_SECRET_PREFIX}{}", key.name),
    )
}

pub struct BindingController {
    registry: Arc<dyn ClusterRegistry>,
    materializer: Materializer,
    reconciler: Reconciler,
    config: Arc<OperonConfig>,
    watch_reporter: Option<WatchReporter>,
}

impl BindingController {
    pub fn new(registry: Arc<dyn ClusterRegistry>, config: Arc<OperonConfig>) -> Self {
        Self {
            materializer: Materializer::new(config.services_namespace.clone()),
            reconciler: Reconciler::new(),
            registry,
            config,
            watch_reporter: None,
        }
    }

    pub fn with_watch_reporter(mut self, reporter: WatchReporter) -> Self {
        self.watch_reporter = Some(reporter);
        self
    }

    /// One reconcile pass for the binding at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> OperonResult<()> {
        let store = self.registry.client_for(OWN_CLUSTER_ID)?;
        let store: &dyn ResourceStore = store.as_ref();

        let Some(binding) = self.fetch(store, key).await? else {
            debug!(binding = %key, "binding is gone, nothing to do");
            return Ok(());
        };

        let state = binding.status.state;
        match self.fetch_instance(store, &binding).await {
            Ok(instance) => match instance.spec.cluster_id.as_deref() {
                None => {
                    debug!(binding = %key, "instance not scheduled on a cluster, ignoring");
                    return Ok(());
                }
                Some(cluster_id) if cluster_id != OWN_CLUSTER_ID => {
                    debug!(binding = %key, cluster_id, "instance belongs to another cluster");
                    return Ok(());
                }
                Some(_) => {}
            },
            // A missing instance stays local: the bind path turns it into
            // orphan cleanup, teardown force-deletes recorded resources.
            Err(err) if err.is_instance_not_found() => {}
            Err(err) => return self.handle_error(store, key, Some(err), Some(state)).await,
        }

        if let Err(err) = self.reconcile_finalizers(store, key).await {
            return self.handle_error(store, key, Some(err), Some(state)).await;
        }

        if state == LifecycleState::Delete && binding.metadata.deletion_timestamp.is_some() {
            let outcome = match self.compute_unbind_resources(store, &binding).await {
                // With an unbind template the plan drives its own teardown:
                // its resources are applied wholesale, everything else
                // recorded becomes an orphan.
                Ok(Some(expected)) => {
                    match self
                        .reconciler
                        .reconcile(store, &expected, &binding.status.resources, true)
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            return self
                                .handle_error(store, key, Some(err), Some(LifecycleState::Delete))
                                .await;
                        }
                    }
                }
                Ok(None) => {
                    self.reconciler
                        .delete_resources(store, &binding.status.resources)
                        .await
                }
                Err(err) => {
                    return self
                        .handle_error(store, key, Some(err), Some(LifecycleState::Delete))
                        .await;
                }
            };
            if let Some(err) = outcome.first_error {
                return self
                    .handle_error(store, key, Some(err), Some(LifecycleState::Delete))
                    .await;
            }
            if let Err(err) = self
                .set_in_progress(store, key, LifecycleState::Delete, outcome.resources)
                .await
            {
                return self
                    .handle_error(store, key, Some(err), Some(LifecycleState::Delete))
                    .await;
            }
        } else if matches!(state, LifecycleState::InQueue | LifecycleState::Update) {
            if let Err(err) = self.apply_expected(store, key, &binding, state).await {
                return self.handle_error(store, key, Some(err), Some(state)).await;
            }
        }

        let Some(binding) = self.fetch(store, key).await? else {
            return Ok(());
        };
        if binding.status.state == LifecycleState::InProgress {
            let last_operation = binding
                .metadata
                .labels
                .get(LAST_OPERATION_LABEL)
                .and_then(|token| LifecycleState::from_label_token(token));
            let result = match last_operation {
                Some(LifecycleState::Delete) => {
                    self.update_unbind_status(store, key, &binding).await
                }
                _ => self.update_bind_status(store, key, &binding).await,
            };
            if let Err(err) = result {
                return self.handle_error(store, key, Some(err), last_operation).await;
            }
        }

        self.handle_error(store, key, None, None).await
    }

    async fn fetch(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
    ) -> OperonResult<Option<ServiceBinding>> {
        match store.get(&resource_key(key)).await {
            Ok(raw) => Ok(Some(ServiceBinding::from_raw(&raw)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// The binding's instance, as a typed not-found error when gone.
    async fn fetch_instance(
        &self,
        store: &dyn ResourceStore,
        binding: &ServiceBinding,
    ) -> OperonResult<ServiceInstance> {
        let raw = store
            .get(&ServiceInstance::resource_key(
                &binding.metadata.namespace,
                &binding.spec.instance_id,
            ))
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => {
                    OperonError::InstanceNotFound(binding.spec.instance_id.clone())
                }
                other => other.into(),
            })?;
        ServiceInstance::from_raw(&raw)
    }

    /// Expected resources for the plan's `unbind` template, owner-stamped.
    /// `None` when the plan has no such template (or the catalog pieces are
    /// already gone mid-teardown); recorded resources are then force-deleted
    /// instead.
    async fn compute_unbind_resources(
        &self,
        store: &dyn ResourceStore,
        binding: &ServiceBinding,
    ) -> OperonResult<Option<Vec<RawResource>>> {
        let instance = match self.fetch_instance(store, binding).await {
            Ok(instance) => instance,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let request = MaterializeRequest::for_binding(binding, &instance);
        match self
            .materializer
            .compute_expected_resources(store, &request, Action::Unbind)
            .await
        {
            Ok(mut expected) => {
                set_owner_references(&binding.owner_reference(), &mut expected)?;
                Ok(Some(expected))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn reconcile_finalizers(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
    ) -> OperonResult<()> {
        with_retries(
            "reconcile binding finalizers",
            self.config.write_attempts,
            || async move {
                let raw = match store.get(&resource_key(key)).await {
                    Ok(raw) => raw,
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
                let mut binding = ServiceBinding::from_raw(&raw)?;
                if binding.metadata.deletion_timestamp.is_none()
                    && !binding.metadata.finalizers.iter().any(|f| f == FINALIZER)
                {
                    binding.metadata.finalizers.push(FINALIZER.to_owned());
                    store.update(&binding.to_raw()?).await?;
                    debug!(binding = %key, "added lifecycle finalizer");
                }
                Ok(())
            },
        )
        .await
    }

    async fn apply_expected(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        binding: &ServiceBinding,
        trigger: LifecycleState,
    ) -> OperonResult<()> {
        let instance = self.fetch_instance(store, binding).await?;
        let request = MaterializeRequest::for_binding(binding, &instance);
        let mut expected = self
            .materializer
            .compute_expected_resources(store, &request, Action::Bind)
            .await?;

        if let Some(reporter) = &self.watch_reporter {
            reporter.report_if_changed(
                "binding",
                &self.config.binding_watch_list,
                &needed_watches(&expected),
            );
        }

        set_owner_references(&binding.owner_reference(), &mut expected)?;
        let outcome = self
            .reconciler
            .reconcile(store, &expected, &binding.status.resources, false)
            .await?;
        if let Some(err) = outcome.first_error {
            return Err(err);
        }
        self.set_in_progress(store, key, trigger, outcome.resources)
            .await
    }

    /// Same stale-write guard as the instance controller: never overwrite
    /// a desired state that moved on while resources were computed.
    async fn set_in_progress(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        trigger: LifecycleState,
        resources: Vec<Source>,
    ) -> OperonResult<()> {
        let resources = &resources;
        with_retries(
            "set binding in progress",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut binding = ServiceBinding::from_raw(&raw)?;
                binding.status.resources = resources.clone();
                if binding.status.state == trigger {
                    binding.metadata.labels.insert(
                        LAST_OPERATION_LABEL.to_owned(),
                        trigger.label_token().to_owned(),
                    );
                    binding.status.state = LifecycleState::InProgress;
                    binding.status.error.clear();
                    if trigger != LifecycleState::Delete {
                        binding.status.applied_spec = Some(binding.spec.clone());
                    }
                    info!(binding = %key, trigger = %trigger, "operation in progress");
                } else {
                    warn!(
                        binding = %key,
                        expected = %trigger,
                        found = %binding.status.state,
                        "state changed while reconciling, not marking in progress"
                    );
                }
                store.update(&binding.to_raw()?).await?;
                Ok(())
            },
        )
        .await
    }

    /// Fold the computed bind status in; on success, materialize the
    /// credentials secret and record it.
    async fn update_bind_status(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        binding: &ServiceBinding,
    ) -> OperonResult<()> {
        let instance = self.fetch_instance(store, binding).await?;
        let request = MaterializeRequest::for_binding(binding, &instance);
        let computed = self
            .materializer
            .compute_status(store, &request, Action::Bind)
            .await?
            .bind;

        let computed = &computed;
        with_retries(
            "update binding status",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut binding = ServiceBinding::from_raw(&raw)?;
                if binding.status.state != LifecycleState::InProgress {
                    return Err(OperonError::precondition(
                        "update binding status",
                        format!("state is {}, not in progress", binding.status.state),
                    ));
                }
                let mut next = binding.status.clone();
                if let Some(state) = computed.state {
                    next.state = state;
                }
                next.error = computed.error.clone();

                if next.state == LifecycleState::Succeeded && next.response.secret_ref.is_none() {
                    let secret_name = self
                        .create_credentials_secret(store, &binding, &computed.response)
                        .await?;
                    next.response.secret_ref = Some(secret_name);
                }

                if next != binding.status {
                    info!(binding = %key, state = %next.state, "binding status updated");
                    binding.status = next;
                    store.update(&binding.to_raw()?).await?;
                }
                Ok(())
            },
        )
        .await
    }

    async fn create_credentials_secret(
        &self,
        store: &dyn ResourceStore,
        binding: &ServiceBinding,
        response: &str,
    ) -> OperonResult<String> {
        let key = secret_key(&binding.key());
        let mut secret = RawResource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": key.name,
                "namespace": key.namespace,
            },
            "stringData": {"response": response},
        }))?;
        secret.set_owner_reference(&binding.owner_reference())?;
        match store.create(&secret).await {
            Ok(_) => info!(secret = %key, "created credentials secret"),
            Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(key.name)
    }

    /// Teardown continuation: delete the credentials secret, drop recorded
    /// resources that are gone, and release the binding once done.
    async fn update_unbind_status(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        binding: &ServiceBinding,
    ) -> OperonResult<()> {
        let computed = match self.fetch_instance(store, binding).await {
            Ok(instance) => {
                let request = MaterializeRequest::for_binding(binding, &instance);
                match self
                    .materializer
                    .compute_status(store, &request, Action::Unbind)
                    .await
                {
                    Ok(doc) => doc.unbind,
                    Err(err) if err.is_not_found() => synthetic_status(key, err),
                    Err(err) => return Err(err),
                }
            }
            Err(err) if err.is_not_found() => synthetic_status(key, err),
            Err(err) => return Err(err),
        };

        match store.delete(&secret_key(key)).await {
            Ok(()) => debug!(binding = %key, "deleted credentials secret"),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let mut remaining = Vec::new();
        for recorded in &binding.status.resources {
            match store.get(&recorded.key()).await {
                Ok(_) => remaining.push(recorded.clone()),
                Err(StoreError::NotFound(_)) => {}
                Err(_) => remaining.push(recorded.clone()),
            }
        }

        // A successful unbind also releases whatever the teardown pass left
        // behind, an unbind template's own resources included.
        if computed.state == Some(LifecycleState::Succeeded) && !remaining.is_empty() {
            let outcome = self.reconciler.delete_resources(store, &remaining).await;
            if let Some(err) = outcome.first_error {
                return Err(err);
            }
            remaining = outcome.resources;
        }

        let computed = &computed;
        let remaining = &remaining;
        with_retries(
            "update binding unbind status",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut binding = ServiceBinding::from_raw(&raw)?;
                if binding.status.state != LifecycleState::InProgress {
                    return Err(OperonError::precondition(
                        "update binding unbind status",
                        format!("state is {}, not in progress", binding.status.state),
                    ));
                }
                let mut next = binding.status.clone();
                if let Some(state) = computed.state {
                    next.state = state;
                }
                next.error = computed.error.clone();
                next.resources = remaining.clone();

                let mut finalizers = binding.metadata.finalizers.clone();
                if computed.state == Some(LifecycleState::Succeeded) || remaining.is_empty() {
                    finalizers.retain(|f| f != FINALIZER);
                    next.state = LifecycleState::Succeeded;
                    info!(binding = %key, "unbind complete, releasing finalizer");
                }

                if next != binding.status || finalizers != binding.metadata.finalizers {
                    binding.status = next;
                    binding.metadata.finalizers = finalizers;
                    store.update(&binding.to_raw()?).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// An orphaned binding deletes itself and flips its desired state so
    /// the next pass runs teardown.
    async fn cleanup_orphan(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
    ) -> OperonResult<()> {
        warn!(binding = %key, "service instance is gone, deleting orphan binding");
        match store.delete(&resource_key(key)).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        with_retries(
            "mark orphan binding for deletion",
            self.config.write_attempts,
            || async move {
                let raw = match store.get(&resource_key(key)).await {
                    Ok(raw) => raw,
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
                let mut binding = ServiceBinding::from_raw(&raw)?;
                if binding.status.state != LifecycleState::Delete {
                    binding.status.state = LifecycleState::Delete;
                    store.update(&binding.to_raw()?).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// Error funnel; see the instance controller for the shape. Bindings
    /// additionally treat a missing instance as an orphan trigger rather
    /// than a failure.
    async fn handle_error(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        error: Option<OperonError>,
        last_operation: Option<LifecycleState>,
    ) -> OperonResult<()> {
        if let Some(err) = &error {
            if err.is_instance_not_found() {
                self.cleanup_orphan(store, key).await?;
                return Ok(());
            }
            // A precondition race is not a failure: the next notification
            // re-evaluates from the newer state.
            if err.is_precondition() {
                debug!(binding = %key, error = %err, "state changed mid-pass, exiting cleanly");
                return Ok(());
            }
        }

        let raw = match store.get(&resource_key(key)).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => {
                return match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
            Err(err) => return Err(err.into()),
        };
        let mut binding = ServiceBinding::from_raw(&raw)?;

        if let Some(err) = &error {
            if err.is_malformed_request() {
                warn!(binding = %key, error = %err, "malformed request, failing without retries");
                binding.status.state = LifecycleState::Failed;
                binding.status.error = err.to_string();
                binding.status.description =
                    format!("Request rejected as malformed, error code 422: {err}");
                if let Some(operation) = last_operation {
                    binding.metadata.labels.insert(
                        LAST_OPERATION_LABEL.to_owned(),
                        operation.label_token().to_owned(),
                    );
                }
                binding.metadata.labels.remove(ERROR_COUNT_LABEL);
                store.update(&binding.to_raw()?).await?;
                return Ok(());
            }
        }

        let count = error_count(&binding.metadata.labels);
        let attempts = self.config.write_attempts;
        match error {
            None => {
                if count == 0 {
                    return Ok(());
                }
                with_retries("reset binding error count", attempts, || async move {
                    let raw = match store.get(&resource_key(key)).await {
                        Ok(raw) => raw,
                        Err(StoreError::NotFound(_)) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    };
                    let mut binding = ServiceBinding::from_raw(&raw)?;
                    if binding.metadata.labels.remove(ERROR_COUNT_LABEL).is_some() {
                        store.update(&binding.to_raw()?).await?;
                    }
                    Ok(())
                })
                .await?;
                debug!(binding = %key, "error count reset");
                Ok(())
            }
            Some(err) => {
                let next_count = count + 1;
                if next_count > self.config.error_threshold {
                    let threshold = self.config.error_threshold;
                    let err_ref = &err;
                    with_retries("mark binding failed", attempts, || async move {
                        let raw = store.get(&resource_key(key)).await?;
                        let mut binding = ServiceBinding::from_raw(&raw)?;
                        binding.status.state = LifecycleState::Failed;
                        binding.status.error = err_ref.to_string();
                        binding.status.description = format!(
                            "Retry threshold of {threshold} reached, giving up: {err_ref}"
                        );
                        if let Some(operation) = last_operation {
                            binding.metadata.labels.insert(
                                LAST_OPERATION_LABEL.to_owned(),
                                operation.label_token().to_owned(),
                            );
                        }
                        binding.metadata.labels.remove(ERROR_COUNT_LABEL);
                        store.update(&binding.to_raw()?).await?;
                        Ok(())
                    })
                    .await?;
                    warn!(binding = %key, error = %err, "retry threshold reached, binding failed");
                    Ok(())
                } else {
                    with_retries("record binding failure", attempts, || async move {
                        let raw = store.get(&resource_key(key)).await?;
                        let mut binding = ServiceBinding::from_raw(&raw)?;
                        binding
                            .metadata
                            .labels
                            .insert(ERROR_COUNT_LABEL.to_owned(), next_count.to_string());
                        store.update(&binding.to_raw()?).await?;
                        Ok(())
                    })
                    .await?;
                    debug!(binding = %key, count = next_count, "recorded failure");
                    Err(err)
                }
            }
        }
    }
}

fn synthetic_status(key: &ObjectKey, err: OperonError) -> ActionStatus {
    warn!(binding = %key, error = %err, "status unavailable during teardown");
    ActionStatus {
        error: err.to_string(),
        ..Default::default()
    }
}
