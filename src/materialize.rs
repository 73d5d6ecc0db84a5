//! Resource materialization: from catalog templates to concrete documents.
//!
//! The materializer assembles the render input for a lifecycle object (the
//! catalog objects, the object itself, and any live source objects the
//! plan's `sources` template names), renders the requested action template,
//! and splits the output into loosely-typed resource documents.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{OperonError, OperonResult};
use crate::model::{
    properties, Action, RawResource, ServiceBinding, ServiceInstance, ServiceOffering,
    ServicePlan,
};
use crate::render::{renderer_for, renderer_input, RenderOutput};
use crate::store::{ResourceStore, StoreError};

/// Preferred file names inside rendered outputs.
const SOURCES_FILE: &str = "sources.yaml";
pub(crate) const STATUS_FILE: &str = "status.yaml";

/// Identifies what to materialize for.
#[derive(Clone, Debug)]
pub struct MaterializeRequest {
    pub instance_id: String,
    /// Set for bind/unbind materialization.
    pub binding_id: Option<String>,
    pub service_id: String,
    pub plan_id: String,
    pub namespace: String,
}

impl MaterializeRequest {
    pub fn for_instance(instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.metadata.name.clone(),
            binding_id: None,
            service_id: instance.spec.service_id.clone(),
            plan_id: instance.spec.plan_id.clone(),
            namespace: instance.metadata.namespace.clone(),
        }
    }

    pub fn for_binding(binding: &ServiceBinding, instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.metadata.name.clone(),
            binding_id: Some(binding.metadata.name.clone()),
            service_id: instance.spec.service_id.clone(),
            plan_id: instance.spec.plan_id.clone(),
            namespace: binding.metadata.namespace.clone(),
        }
    }
}

/// Assembled render input plus the plan that drives it.
pub(crate) struct MaterializedInput {
    pub plan: ServicePlan,
    pub values: Map<String, Value>,
    pub release_name: String,
}

pub struct Materializer {
    services_namespace: String,
}

impl Materializer {
    pub fn new(services_namespace: impl Into<String>) -> Self {
        Self {
            services_namespace: services_namespace.into(),
        }
    }

    /// Render the action template and split it into resource documents,
    /// stamped into the request's namespace.
    pub async fn compute_expected_resources(
        &self,
        store: &dyn ResourceStore,
        request: &MaterializeRequest,
        action: Action,
    ) -> OperonResult<Vec<RawResource>> {
        let input = self.prepare(store, request, action).await?;
        let template = input.plan.template(action)?;
        let render_input =
            renderer_input(template, &input.release_name, &request.namespace, input.values)?;
        let output = renderer_for(template.engine).render(&render_input)?;
        if output.is_empty() {
            return Err(OperonError::renderer(
                "chart",
                format!("{action} template rendered no files"),
                None,
            ));
        }

        let mut resources = Vec::new();
        for file in output.files() {
            let content = output.file_content(file)?;
            for mut resource in split_documents(content)? {
                resource.set_namespace(&request.namespace);
                resources.push(resource);
            }
        }
        debug!(
            instance_id = %request.instance_id,
            action = %action,
            count = resources.len(),
            "computed expected resources"
        );
        Ok(resources)
    }

    /// Assemble catalog objects, the lifecycle objects and resolved source
    /// objects into the render input for `action`.
    pub(crate) async fn prepare(
        &self,
        store: &dyn ResourceStore,
        request: &MaterializeRequest,
        action: Action,
    ) -> OperonResult<MaterializedInput> {
        let instance_raw = store
            .get(&ServiceInstance::resource_key(
                &request.namespace,
                &request.instance_id,
            ))
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => {
                    OperonError::InstanceNotFound(request.instance_id.clone())
                }
                other => other.into(),
            })?;

        let binding_raw = match request.binding_id.as_deref() {
            Some(binding_id) => Some(
                store
                    .get(&ServiceBinding::resource_key(&request.namespace, binding_id))
                    .await
                    .map_err(|err| match err {
                        StoreError::NotFound(_) => {
                            OperonError::BindingNotFound(binding_id.to_owned())
                        }
                        other => other.into(),
                    })?,
            ),
            None => None,
        };

        let (offering_raw, plan_raw) = self.fetch_catalog(store, request).await?;
        let plan = ServicePlan::from_raw(&plan_raw)?;

        let release_name = match (action, binding_raw.as_ref()) {
            (Action::Bind, Some(binding)) => binding.name().to_owned(),
            _ => instance_raw.name().to_owned(),
        };

        let mut values = Map::new();
        values.insert("service".into(), offering_raw.into_body());
        values.insert("plan".into(), plan_raw.into_body());
        values.insert("instance".into(), instance_raw.into_body());
        if let Some(binding) = binding_raw {
            values.insert("binding".into(), binding.into_body());
        }

        self.resolve_sources(store, request, &plan, &release_name, &mut values)
            .await?;

        Ok(MaterializedInput {
            plan,
            values,
            release_name,
        })
    }

    /// Render the plan's `sources` template and pull every named object
    /// into the values map. Objects that cannot be fetched are skipped;
    /// templates must tolerate their absence.
    async fn resolve_sources(
        &self,
        store: &dyn ResourceStore,
        request: &MaterializeRequest,
        plan: &ServicePlan,
        release_name: &str,
        values: &mut Map<String, Value>,
    ) -> OperonResult<()> {
        let template = plan.template(Action::Sources)?;
        let render_input =
            renderer_input(template, release_name, &request.namespace, values.clone())?;
        let output = renderer_for(template.engine).render(&render_input)?;
        let content = select_file(&output, SOURCES_FILE)?;
        let sources = properties::parse_sources(content)?;

        for (name, source) in sources {
            if name.is_empty() || source.name.is_empty() {
                debug!(entry = %name, "source entry without a name, skipping");
                continue;
            }
            let mut key = source.key();
            if key.namespace.is_empty() {
                key.namespace = request.namespace.clone();
            }
            match store.get(&key).await {
                Ok(resource) => {
                    values.insert(name, resource.into_body());
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(source = %key, "source object not found, skipping");
                }
                Err(err) => {
                    warn!(source = %key, error = %err, "failed to fetch source object, skipping");
                }
            }
        }
        Ok(())
    }

    async fn fetch_catalog(
        &self,
        store: &dyn ResourceStore,
        request: &MaterializeRequest,
    ) -> OperonResult<(RawResource, RawResource)> {
        let offerings = store
            .list(
                crate::model::plan::CATALOG_API_VERSION,
                ServiceOffering::KIND,
                &self.services_namespace,
                &Default::default(),
            )
            .await?;
        let offering = offerings
            .into_iter()
            .find(|raw| {
                ServiceOffering::from_raw(raw)
                    .map(|offering| offering.spec.id == request.service_id)
                    .unwrap_or(false)
            })
            .ok_or_else(|| OperonError::OfferingNotFound(request.service_id.clone()))?;

        let plans = store
            .list(
                crate::model::plan::CATALOG_API_VERSION,
                ServicePlan::KIND,
                &self.services_namespace,
                &Default::default(),
            )
            .await?;
        let plan = plans
            .into_iter()
            .find(|raw| {
                ServicePlan::from_raw(raw)
                    .map(|plan| {
                        plan.spec.id == request.plan_id
                            && plan.spec.service_id == request.service_id
                    })
                    .unwrap_or(false)
            })
            .ok_or_else(|| OperonError::PlanNotFound(request.plan_id.clone()))?;

        Ok((offering, plan))
    }
}

/// Pick `preferred` out of a rendered output, falling back to the first
/// file. Chart outputs prefix file names with the chart name, so a suffix
/// match counts too.
pub(crate) fn select_file<'a>(
    output: &'a RenderOutput,
    preferred: &str,
) -> OperonResult<&'a str> {
    let suffix = format!("/{preferred}");
    let chosen = output
        .files()
        .find(|file| *file == preferred || file.ends_with(&suffix))
        .or_else(|| output.files().next())
        .ok_or_else(|| {
            OperonError::renderer("output", "rendered output has no files", None)
        })?;
    output.file_content(chosen)
}

/// Split a multi-document yaml string into resource documents. Blank
/// documents are skipped; non-mapping documents are a conversion error.
pub(crate) fn split_documents(content: &str) -> OperonResult<Vec<RawResource>> {
    let mut resources = Vec::new();
    for document in content.split("---") {
        let trimmed = document.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = serde_yaml::from_str(trimmed)
            .map_err(|err| OperonError::unmarshal("resource document", err))?;
        resources.push(RawResource::from_value(value)?);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::{PlanSpec, TemplateSpec, CATALOG_API_VERSION};
    use crate::model::{LifecycleState, ObjectMeta};
    use crate::store::MemoryStore;
    use serde_json::json;

    const NAMESPACE: &str = "default";
    const SERVICES: &str = "operon-services";

    async fn seed_catalog(store: &MemoryStore, templates: Vec<TemplateSpec>) {
        let offering = RawResource::from_value(json!({
            "apiVersion": CATALOG_API_VERSION,
            "kind": "ServiceOffering",
            "metadata": {"name": "svc-a", "namespace": SERVICES},
            "spec": {"id": "svc-a", "name": "database", "bindable": true}
        }))
        .unwrap();
        store.create(&offering).await.unwrap();

        let plan = ServicePlan {
            metadata: ObjectMeta {
                name: "plan-a".into(),
                namespace: SERVICES.into(),
                ..Default::default()
            },
            spec: PlanSpec {
                id: "plan-a".into(),
                service_id: "svc-a".into(),
                bindable: true,
                templates,
                ..Default::default()
            },
        };
        let mut value = serde_json::to_value(&plan).unwrap();
        value["apiVersion"] = json!(CATALOG_API_VERSION);
        value["kind"] = json!("ServicePlan");
        store
            .create(&RawResource::from_value(value).unwrap())
            .await
            .unwrap();
    }

    async fn seed_instance(store: &MemoryStore) -> ServiceInstance {
        let mut instance = ServiceInstance::default();
        instance.metadata.name = "i1".into();
        instance.metadata.namespace = NAMESPACE.into();
        instance.spec.service_id = "svc-a".into();
        instance.spec.plan_id = "plan-a".into();
        instance.status.state = LifecycleState::InQueue;
        store.create(&instance.to_raw().unwrap()).await.unwrap();
        instance
    }

    fn default_templates() -> Vec<TemplateSpec> {
        vec![
            TemplateSpec::literal(
                Action::Provision,
                "apiVersion: apps/v1\nkind: StatefulSet\nmetadata:\n  name: {{ instance.metadata.name }}-db\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: {{ instance.metadata.name }}-db\n",
            ),
            TemplateSpec::literal(
                Action::Sources,
                "db:\n  apiVersion: apps/v1\n  kind: StatefulSet\n  name: {{ instance.metadata.name }}-db\n  namespace: {{ release.namespace }}\n",
            ),
        ]
    }

    // ---- document splitting ----

    #[test]
    fn split_skips_blank_documents() {
        let resources = split_documents(
            "---\n\nkind: A\nmetadata:\n  name: a\n---\n   \n---\nkind: B\nmetadata:\n  name: b\n",
        )
        .unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].kind(), "A");
        assert_eq!(resources[1].kind(), "B");
    }

    #[test]
    fn split_rejects_non_mapping_documents() {
        assert!(split_documents("- a\n- b\n").is_err());
        assert!(split_documents("not: [valid").is_err());
    }

    // ---- expected resources ----

    #[tokio::test]
    async fn renders_and_stamps_namespace() {
        let store = MemoryStore::new();
        seed_catalog(&store, default_templates()).await;
        let instance = seed_instance(&store).await;

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_instance(&instance);
        let resources = materializer
            .compute_expected_resources(&store, &request, Action::Provision)
            .await
            .unwrap();

        assert_eq!(resources.len(), 2);
        assert!(resources.iter().all(|r| r.namespace() == NAMESPACE));
        assert_eq!(resources[0].name(), "i1-db");
    }

    #[tokio::test]
    async fn source_objects_feed_later_renders() {
        let store = MemoryStore::new();
        let mut templates = default_templates();
        templates.push(TemplateSpec::literal(
            Action::Bind,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ binding.metadata.name }}-cm\ndata:\n  host: {{ db.metadata.name }}\n",
        ));
        seed_catalog(&store, templates).await;
        let instance = seed_instance(&store).await;

        // The source object the sources template names.
        store
            .create(&RawResource::new("apps/v1", "StatefulSet", NAMESPACE, "i1-db"))
            .await
            .unwrap();
        let mut binding = ServiceBinding::default();
        binding.metadata.name = "b1".into();
        binding.metadata.namespace = NAMESPACE.into();
        binding.spec.instance_id = "i1".into();
        store.create(&binding.to_raw().unwrap()).await.unwrap();

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_binding(&binding, &instance);
        let resources = materializer
            .compute_expected_resources(&store, &request, Action::Bind)
            .await
            .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].body()["data"]["host"], json!("i1-db"));
    }

    #[tokio::test]
    async fn missing_source_objects_are_skipped() {
        let store = MemoryStore::new();
        seed_catalog(&store, default_templates()).await;
        let instance = seed_instance(&store).await;

        // i1-db does not exist; provisioning must still work because the
        // provision template never dereferences the source.
        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_instance(&instance);
        let resources = materializer
            .compute_expected_resources(&store, &request, Action::Provision)
            .await
            .unwrap();
        assert_eq!(resources.len(), 2);
    }

    #[tokio::test]
    async fn unnamed_source_entries_are_ignored() {
        let store = MemoryStore::new();
        let mut templates = default_templates();
        templates[1] = TemplateSpec::literal(
            Action::Sources,
            concat!(
                "db:\n  apiVersion: apps/v1\n  kind: StatefulSet\n  name: i1-db\n  namespace: default\n",
                "\"\":\n  apiVersion: v1\n  kind: ConfigMap\n  name: stray\n  namespace: default\n",
                "empty:\n  apiVersion: v1\n  kind: ConfigMap\n  name: \"\"\n  namespace: default\n",
            ),
        );
        seed_catalog(&store, templates).await;
        let instance = seed_instance(&store).await;
        store
            .create(&RawResource::new("apps/v1", "StatefulSet", NAMESPACE, "i1-db"))
            .await
            .unwrap();
        store
            .create(&RawResource::new("v1", "ConfigMap", NAMESPACE, "stray"))
            .await
            .unwrap();

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_instance(&instance);
        let input = materializer
            .prepare(&store, &request, Action::Provision)
            .await
            .unwrap();
        assert!(input.values.contains_key("db"));
        assert!(!input.values.contains_key(""));
        assert!(!input.values.contains_key("empty"));
    }

    // ---- failure shapes ----

    #[tokio::test]
    async fn missing_instance_is_typed_not_found() {
        let store = MemoryStore::new();
        seed_catalog(&store, default_templates()).await;

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest {
            instance_id: "ghost".into(),
            binding_id: None,
            service_id: "svc-a".into(),
            plan_id: "plan-a".into(),
            namespace: NAMESPACE.into(),
        };
        let err = materializer
            .compute_expected_resources(&store, &request, Action::Provision)
            .await
            .unwrap_err();
        assert!(err.is_instance_not_found());
    }

    #[tokio::test]
    async fn missing_action_template_is_typed_not_found() {
        let store = MemoryStore::new();
        seed_catalog(&store, default_templates()).await;
        let instance = seed_instance(&store).await;

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_instance(&instance);
        let err = materializer
            .compute_expected_resources(&store, &request, Action::Bind)
            .await
            .unwrap_err();
        assert!(err.is_template_not_found());
    }

    #[tokio::test]
    async fn unknown_plan_is_typed_not_found() {
        let store = MemoryStore::new();
        seed_catalog(&store, default_templates()).await;
        let mut instance = seed_instance(&store).await;
        instance.spec.plan_id = "plan-z".into();

        let materializer = Materializer::new(SERVICES);
        let request = MaterializeRequest::for_instance(&instance);
        let err = materializer
            .compute_expected_resources(&store, &request, Action::Provision)
            .await
            .unwrap_err();
        assert!(matches!(err, OperonError::PlanNotFound(_)));
    }
}
