//! Service catalog: offerings, plans and their templates.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{OperonError, OperonResult};
use crate::model::object::ObjectMeta;
use crate::model::resource::{RawResource, ResourceKey};

/// API group/version under which catalog objects are stored.
pub const CATALOG_API_VERSION: &str = "catalog.operon.io/v1alpha1";

/// Lifecycle actions a plan can carry templates for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Provision,
    Bind,
    Unbind,
    Status,
    Sources,
    /// Scheduling hint consumed by placement tooling, never rendered here.
    #[serde(rename = "clusterSelector")]
    ClusterSelector,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Status => "status",
            Self::Sources => "sources",
            Self::ClusterSelector => "clusterSelector",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of template engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateEngine {
    /// Single inline template rendered to one file named `main`.
    Text,
    /// Packaged chart directory: many templates plus default values.
    Chart,
}

impl fmt::Display for TemplateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("text"),
            Self::Chart => f.write_str("chart"),
        }
    }
}

/// One action template declared by a plan.
///
/// Content resolution order: non-empty `content` wins, then `content_encoded`
/// (base64). Chart templates additionally carry a `url` naming the chart
/// directory; their content, when present, is a values template.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    pub action: Action,
    #[serde(rename = "type")]
    pub engine: TemplateEngine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoded: Option<String>,
}

impl TemplateSpec {
    pub fn literal(action: Action, content: impl Into<String>) -> Self {
        Self {
            action,
            engine: TemplateEngine::Text,
            url: None,
            content: Some(content.into()),
            content_encoded: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Offerings
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferingSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceOffering {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: OfferingSpec,
}

impl ServiceOffering {
    pub const KIND: &'static str = "ServiceOffering";

    pub fn resource_key(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(CATALOG_API_VERSION, Self::KIND, namespace, name)
    }

    pub fn from_raw(raw: &RawResource) -> OperonResult<Self> {
        serde_json::from_value(raw.body().clone())
            .map_err(|err| OperonError::unmarshal("service offering", err))
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicePlan {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PlanSpec,
}

impl ServicePlan {
    pub const KIND: &'static str = "ServicePlan";

    pub fn resource_key(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(CATALOG_API_VERSION, Self::KIND, namespace, name)
    }

    pub fn from_raw(raw: &RawResource) -> OperonResult<Self> {
        serde_json::from_value(raw.body().clone())
            .map_err(|err| OperonError::unmarshal("service plan", err))
    }

    /// The template for `action`, as a typed not-found error when absent.
    pub fn template(&self, action: Action) -> OperonResult<&TemplateSpec> {
        self.spec
            .templates
            .iter()
            .find(|template| template.action == action)
            .ok_or_else(|| OperonError::TemplateNotFound {
                plan_id: self.spec.id.clone(),
                action: action.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_with(actions: &[Action]) -> ServicePlan {
        let mut plan = ServicePlan::default();
        plan.spec.id = "plan-a".into();
        plan.spec.templates = actions
            .iter()
            .map(|action| TemplateSpec::literal(*action, "kind: ConfigMap"))
            .collect();
        plan
    }

    // ---- template lookup ----

    #[test]
    fn template_lookup_finds_declared_action() {
        let plan = plan_with(&[Action::Provision, Action::Sources]);
        assert!(plan.template(Action::Provision).is_ok());
        assert!(plan.template(Action::Sources).is_ok());
    }

    #[test]
    fn missing_template_is_typed_not_found() {
        let plan = plan_with(&[Action::Provision]);
        let err = plan.template(Action::Bind).unwrap_err();
        assert!(err.is_template_not_found());
        assert!(err.to_string().contains("plan-a"));
        assert!(err.to_string().contains("bind"));
    }

    // ---- serde shapes ----

    #[test]
    fn template_spec_decodes_catalog_yaml() {
        let template: TemplateSpec = serde_yaml::from_str(
            "action: provision\ntype: chart\nurl: ./charts/db\ncontentEncoded: dmFsdWVzOiB7fQ==\n",
        )
        .unwrap();
        assert_eq!(template.action, Action::Provision);
        assert_eq!(template.engine, TemplateEngine::Chart);
        assert_eq!(template.url.as_deref(), Some("./charts/db"));
        assert!(template.content.is_none());
    }

    #[test]
    fn unknown_engine_is_rejected() {
        let result: Result<TemplateSpec, _> =
            serde_yaml::from_str("action: provision\ntype: gotemplate\ncontent: hi\n");
        assert!(result.is_err());
    }

    #[test]
    fn plan_round_trips_from_raw() {
        let raw = RawResource::from_value(json!({
            "apiVersion": CATALOG_API_VERSION,
            "kind": "ServicePlan",
            "metadata": {"name": "plan-a", "namespace": "operon-services"},
            "spec": {
                "id": "plan-a",
                "serviceId": "svc-a",
                "bindable": true,
                "templates": [
                    {"action": "provision", "type": "text", "content": "kind: X"}
                ]
            }
        }))
        .unwrap();
        let plan = ServicePlan::from_raw(&raw).unwrap();
        assert_eq!(plan.spec.service_id, "svc-a");
        assert!(plan.spec.bindable);
        assert_eq!(plan.spec.templates.len(), 1);
    }
}
