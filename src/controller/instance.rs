//! Service instance lifecycle controller.
//!
//! One reconcile pass is level-triggered and idempotent: it looks at the
//! instance's desired state, materializes and reconciles downstream
//! resources, flips the object to `in progress`, and then folds the
//! computed status back in. Failures run through an error funnel that
//! counts consecutive failures and gives up past a threshold; malformed
//! requests skip the funnel and fail immediately.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::OperonConfig;
use crate::controller::{
    error_count, needed_watches, with_retries, WatchReporter, ERROR_COUNT_LABEL, FINALIZER,
    LAST_OPERATION_LABEL, OWN_CLUSTER_ID,
};
use crate::errors::{OperonError, OperonResult};
use crate::materialize::{MaterializeRequest, Materializer};
use crate::model::{Action, ActionStatus, LifecycleState, ObjectKey, ResourceKey, ServiceInstance};
use crate::reconcile::{set_owner_references, Reconciler};
use crate::store::{ClusterRegistry, ResourceStore, StoreError};

fn resource_key(key: &ObjectKey) -> ResourceKey {
    ServiceInstance::resource_key(&key.namespace, &key.name)
}

pub struct InstanceController {
    registry: Arc<dyn ClusterRegistry>,
    materializer: Materializer,
    reconciler: Reconciler,
    config: Arc<OperonConfig>,
    watch_reporter: Option<WatchReporter>,
}

impl InstanceController {
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

    /// One reconcile pass for the instance at `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> OperonResult<()> {
        let store = self.registry.client_for(OWN_CLUSTER_ID)?;
        let store: &dyn ResourceStore = store.as_ref();

        let Some(instance) = self.fetch(store, key).await? else {
            debug!(instance = %key, "instance is gone, nothing to do");
            return Ok(());
        };

        match instance.spec.cluster_id.as_deref() {
            None => {
                debug!(instance = %key, "instance not scheduled on a cluster, ignoring");
                return Ok(());
            }
            Some(cluster_id) if cluster_id != OWN_CLUSTER_ID => {
                debug!(instance = %key, cluster_id, "instance belongs to another cluster");
                return Ok(());
            }
            Some(_) => {}
        }

        let state = instance.status.state;
        if let Err(err) = self.reconcile_finalizers(store, key).await {
            return self.handle_error(store, key, Some(err), Some(state)).await;
        }

        if state == LifecycleState::Delete && instance.metadata.deletion_timestamp.is_some() {
            let outcome = self
                .reconciler
                .delete_resources(store, &instance.status.resources)
                .await;
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
            if let Err(err) = self.apply_expected(store, key, &instance, state).await {
                return self.handle_error(store, key, Some(err), Some(state)).await;
            }
        }

        // Fresh look after any state flip above.
        let Some(instance) = self.fetch(store, key).await? else {
            return Ok(());
        };
        if instance.status.state == LifecycleState::InProgress {
            let last_operation = instance
                .metadata
                .labels
                .get(LAST_OPERATION_LABEL)
                .and_then(|token| LifecycleState::from_label_token(token));
            let result = match last_operation {
                Some(LifecycleState::Delete) => {
                    self.update_deprovision_status(store, key, &instance).await
                }
                _ => self.update_provision_status(store, key, &instance).await,
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
    ) -> OperonResult<Option<ServiceInstance>> {
        match store.get(&resource_key(key)).await {
            Ok(raw) => Ok(Some(ServiceInstance::from_raw(&raw)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Make sure a live, not-yet-deleting instance carries the lifecycle
    /// finalizer so teardown stays observable.
    async fn reconcile_finalizers(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
    ) -> OperonResult<()> {
        with_retries(
            "reconcile instance finalizers",
            self.config.write_attempts,
            || async move {
                let raw = match store.get(&resource_key(key)).await {
                    Ok(raw) => raw,
                    Err(StoreError::NotFound(_)) => return Ok(()),
                    Err(err) => return Err(err.into()),
                };
                let mut instance = ServiceInstance::from_raw(&raw)?;
                if instance.metadata.deletion_timestamp.is_none()
                    && !instance.metadata.finalizers.iter().any(|f| f == FINALIZER)
                {
                    instance.metadata.finalizers.push(FINALIZER.to_owned());
                    store.update(&instance.to_raw()?).await?;
                    debug!(instance = %key, "added lifecycle finalizer");
                }
                Ok(())
            },
        )
        .await
    }

    /// Materialize and reconcile the expected resources for a provision or
    /// update trigger, then flip the instance to `in progress`.
    async fn apply_expected(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        instance: &ServiceInstance,
        trigger: LifecycleState,
    ) -> OperonResult<()> {
        let request = MaterializeRequest::for_instance(instance);
        let mut expected = self
            .materializer
            .compute_expected_resources(store, &request, Action::Provision)
            .await?;

        if let Some(reporter) = &self.watch_reporter {
            reporter.report_if_changed(
                "instance",
                &self.config.instance_watch_list,
                &needed_watches(&expected),
            );
        }

        set_owner_references(&instance.owner_reference(), &mut expected)?;
        let outcome = self
            .reconciler
            .reconcile(store, &expected, &instance.status.resources, false)
            .await?;
        if let Some(err) = outcome.first_error {
            return Err(err);
        }
        self.set_in_progress(store, key, trigger, outcome.resources)
            .await
    }

    /// Record the reconciled resources and flip the state to `in progress`
    /// — but only when the persisted state still equals the trigger. A
    /// caller may have changed the desired state while resources were
    /// being computed; that newer intent must not be overwritten.
    async fn set_in_progress(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        trigger: LifecycleState,
        resources: Vec<crate::model::Source>,
    ) -> OperonResult<()> {
        let resources = &resources;
        with_retries(
            "set instance in progress",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut instance = ServiceInstance::from_raw(&raw)?;
                instance.status.resources = resources.clone();
                if instance.status.state == trigger {
                    instance.metadata.labels.insert(
                        LAST_OPERATION_LABEL.to_owned(),
                        trigger.label_token().to_owned(),
                    );
                    instance.status.state = LifecycleState::InProgress;
                    instance.status.error.clear();
                    instance.status.description.clear();
                    if trigger != LifecycleState::Delete {
                        instance.status.applied_spec = Some(instance.spec.clone());
                    }
                    info!(instance = %key, trigger = %trigger, "operation in progress");
                } else {
                    warn!(
                        instance = %key,
                        expected = %trigger,
                        found = %instance.status.state,
                        "state changed while reconciling, not marking in progress"
                    );
                }
                store.update(&instance.to_raw()?).await?;
                Ok(())
            },
        )
        .await
    }

    /// Fold the computed provision status into the object.
    async fn update_provision_status(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        instance: &ServiceInstance,
    ) -> OperonResult<()> {
        let request = MaterializeRequest::for_instance(instance);
        let computed = self
            .materializer
            .compute_status(store, &request, Action::Provision)
            .await?
            .provision;
        let computed = &computed;
        with_retries(
            "update instance status",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut instance = ServiceInstance::from_raw(&raw)?;
                if instance.status.state != LifecycleState::InProgress {
                    return Err(OperonError::precondition(
                        "update instance status",
                        format!("state is {}, not in progress", instance.status.state),
                    ));
                }
                let mut next = instance.status.clone();
                if let Some(state) = computed.state {
                    next.state = state;
                }
                next.error = computed.error.clone();
                next.description = computed.response.clone();
                if computed.dashboard_url.is_some() {
                    next.dashboard_url = computed.dashboard_url.clone();
                }
                if computed.instance_usable.is_some() {
                    next.instance_usable = computed.instance_usable;
                }
                if computed.update_repeatable.is_some() {
                    next.update_repeatable = computed.update_repeatable;
                }
                if next != instance.status {
                    info!(instance = %key, state = %next.state, "instance status updated");
                    instance.status = next;
                    store.update(&instance.to_raw()?).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// Teardown continuation: drop recorded resources that are gone and,
    /// once everything is gone (or the template reports success), release
    /// the finalizer and mark the instance succeeded.
    async fn update_deprovision_status(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        instance: &ServiceInstance,
    ) -> OperonResult<()> {
        let request = MaterializeRequest::for_instance(instance);
        let computed = match self
            .materializer
            .compute_status(store, &request, Action::Provision)
            .await
        {
            Ok(doc) => doc.deprovision,
            Err(err) if err.is_not_found() => {
                // Catalog pieces may already be gone mid-teardown; keep
                // deleting on observed liveness alone.
                warn!(instance = %key, error = %err, "status unavailable during teardown");
                ActionStatus {
                    error: err.to_string(),
                    ..Default::default()
                }
            }
            Err(err) => return Err(err),
        };

        let mut remaining = Vec::new();
        for recorded in &instance.status.resources {
            match store.get(&recorded.key()).await {
                Ok(_) => remaining.push(recorded.clone()),
                Err(StoreError::NotFound(_)) => {}
                Err(_) => remaining.push(recorded.clone()),
            }
        }

        let computed = &computed;
        let remaining = &remaining;
        with_retries(
            "update instance deprovision status",
            self.config.write_attempts,
            || async move {
                let raw = store.get(&resource_key(key)).await?;
                let mut instance = ServiceInstance::from_raw(&raw)?;
                if instance.status.state != LifecycleState::InProgress {
                    return Err(OperonError::precondition(
                        "update instance deprovision status",
                        format!("state is {}, not in progress", instance.status.state),
                    ));
                }
                let mut next = instance.status.clone();
                if let Some(state) = computed.state {
                    next.state = state;
                }
                next.error = computed.error.clone();
                next.description = computed.response.clone();
                next.resources = remaining.clone();

                let mut finalizers = instance.metadata.finalizers.clone();
                if computed.state == Some(LifecycleState::Succeeded) || remaining.is_empty() {
                    finalizers.retain(|f| f != FINALIZER);
                    next.state = LifecycleState::Succeeded;
                    info!(instance = %key, "deprovision complete, releasing finalizer");
                }

                if next != instance.status || finalizers != instance.metadata.finalizers {
                    instance.status = next;
                    instance.metadata.finalizers = finalizers;
                    store.update(&instance.to_raw()?).await?;
                }
                Ok(())
            },
        )
        .await
    }

    /// Error funnel. `None` resets the consecutive-failure count; `Some`
    /// increments it and marks the instance failed past the threshold.
    /// Malformed requests fail immediately without touching the budget.
    async fn handle_error(
        &self,
        store: &dyn ResourceStore,
        key: &ObjectKey,
        error: Option<OperonError>,
        last_operation: Option<LifecycleState>,
    ) -> OperonResult<()> {
        if let Some(err) = &error {
            // A precondition race is not a failure: the next notification
            // re-evaluates from the newer state.
            if err.is_precondition() {
                debug!(instance = %key, error = %err, "state changed mid-pass, exiting cleanly");
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
        let mut instance = ServiceInstance::from_raw(&raw)?;

        if let Some(err) = &error {
            if err.is_malformed_request() {
                warn!(instance = %key, error = %err, "malformed request, failing without retries");
                instance.status.state = LifecycleState::Failed;
                instance.status.error = err.to_string();
                instance.status.description =
                    format!("Request rejected as malformed, error code 422: {err}");
                if let Some(operation) = last_operation {
                    instance.metadata.labels.insert(
                        LAST_OPERATION_LABEL.to_owned(),
                        operation.label_token().to_owned(),
                    );
                }
                instance.metadata.labels.remove(ERROR_COUNT_LABEL);
                store.update(&instance.to_raw()?).await?;
                return Ok(());
            }
        }

        let count = error_count(&instance.metadata.labels);
        let attempts = self.config.write_attempts;
        match error {
            None => {
                if count == 0 {
                    return Ok(());
                }
                with_retries("reset instance error count", attempts, || async move {
                    let raw = match store.get(&resource_key(key)).await {
                        Ok(raw) => raw,
                        Err(StoreError::NotFound(_)) => return Ok(()),
                        Err(err) => return Err(err.into()),
                    };
                    let mut instance = ServiceInstance::from_raw(&raw)?;
                    if instance.metadata.labels.remove(ERROR_COUNT_LABEL).is_some() {
                        store.update(&instance.to_raw()?).await?;
                    }
                    Ok(())
                })
                .await?;
                debug!(instance = %key, "error count reset");
                Ok(())
            }
            Some(err) => {
                let next_count = count + 1;
                if next_count > self.config.error_threshold {
                    let threshold = self.config.error_threshold;
                    let err_ref = &err;
                    with_retries("mark instance failed", attempts, || async move {
                        let raw = store.get(&resource_key(key)).await?;
                        let mut instance = ServiceInstance::from_raw(&raw)?;
                        instance.status.state = LifecycleState::Failed;
                        instance.status.error = err_ref.to_string();
                        instance.status.description = format!(
                            "Retry threshold of {threshold} reached, giving up: {err_ref}"
                        );
                        if let Some(operation) = last_operation {
                            instance.metadata.labels.insert(
                                LAST_OPERATION_LABEL.to_owned(),
                                operation.label_token().to_owned(),
                            );
                        }
                        instance.metadata.labels.remove(ERROR_COUNT_LABEL);
                        store.update(&instance.to_raw()?).await?;
                        Ok(())
                    })
                    .await?;
                    warn!(instance = %key, error = %err, "retry threshold reached, instance failed");
                    Ok(())
                } else {
                    with_retries("record instance failure", attempts, || async move {
                        let raw = store.get(&resource_key(key)).await?;
                        let mut instance = ServiceInstance::from_raw(&raw)?;
                        instance
                            .metadata
                            .labels
                            .insert(ERROR_COUNT_LABEL.to_owned(), next_count.to_string());
                        store.update(&instance.to_raw()?).await?;
                        Ok(())
                    })
                    .await?;
                    debug!(instance = %key, count = next_count, "recorded failure");
                    Err(err)
                }
            }
        }
    }
}
