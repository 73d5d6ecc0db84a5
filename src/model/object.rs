//! Lifecycle objects: service instances and service bindings.
//!
//! Both object kinds share the same lifecycle vocabulary: a desired state is
//! written by the caller (`in_queue`, `update`, `delete`), the controller
//! flips it to `in progress` while it works, and the status template decides
//! the terminal state (`succeeded` or `failed`).

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{OperonError, OperonResult};
use crate::model::resource::{RawResource, ResourceKey};

/// API group/version under which lifecycle objects are stored.
pub const LIFECYCLE_API_VERSION: &str = "osb.operon.io/v1alpha1";

/// Namespaced identity of a lifecycle object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The closed set of lifecycle states.
///
/// `in progress` keeps its embedded space on the wire; the remaining states
/// double as label-safe tokens used for last-operation bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    #[serde(rename = "in_queue")]
    InQueue,
    #[serde(rename = "update")]
    Update,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InQueue => "in_queue",
            Self::Update => "update",
            Self::InProgress => "in progress",
            Self::Delete => "delete",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Label token for last-operation bookkeeping. `in progress` never
    /// appears as a label value, so every token is label-safe.
    pub fn label_token(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            other => other.as_str(),
        }
    }

    pub fn from_label_token(token: &str) -> Option<Self> {
        match token {
            "in_queue" => Some(Self::InQueue),
            "update" => Some(Self::Update),
            "in_progress" => Some(Self::InProgress),
            "delete" => Some(Self::Delete),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a downstream resource recorded in object status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl Source {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.api_version, &self.kind, &self.namespace, &self.name)
    }

    pub fn of(resource: &RawResource) -> Self {
        Self {
            api_version: resource.api_version().to_owned(),
            kind: resource.kind().to_owned(),
            name: resource.name().to_owned(),
            namespace: resource.namespace().to_owned(),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Metadata shared by typed lifecycle objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Owner reference stamped onto materialized resources so downstream garbage
/// collection can follow ownership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

// ---------------------------------------------------------------------------
// Service instances
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_usable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_repeatable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<InstanceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Source>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl ServiceInstance {
    pub const KIND: &'static str = "ServiceInstance";

    pub fn resource_key(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(LIFECYCLE_API_VERSION, Self::KIND, namespace, name)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn from_raw(raw: &RawResource) -> OperonResult<Self> {
        serde_json::from_value(raw.body().clone())
            .map_err(|err| OperonError::unmarshal("service instance", err))
    }

    pub fn to_raw(&self) -> OperonResult<RawResource> {
        typed_to_raw(self, LIFECYCLE_API_VERSION, Self::KIND)
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: LIFECYCLE_API_VERSION.to_owned(),
            kind: Self::KIND.to_owned(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Service bindings
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<BindingSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Source>,
    #[serde(default)]
    pub response: BindingResponse,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBinding {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BindingSpec,
    #[serde(default)]
    pub status: BindingStatus,
}

impl ServiceBinding {
    pub const KIND: &'static str = "ServiceBinding";

    pub fn resource_key(namespace: &str, name: &str) -> ResourceKey {
        ResourceKey::new(LIFECYCLE_API_VERSION, Self::KIND, namespace, name)
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn from_raw(raw: &RawResource) -> OperonResult<Self> {
        serde_json::from_value(raw.body().clone())
            .map_err(|err| OperonError::unmarshal("service binding", err))
    }

    pub fn to_raw(&self) -> OperonResult<RawResource> {
        typed_to_raw(self, LIFECYCLE_API_VERSION, Self::KIND)
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: LIFECYCLE_API_VERSION.to_owned(),
            kind: Self::KIND.to_owned(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: true,
        }
    }
}

fn typed_to_raw<T: Serialize>(typed: &T, api_version: &str, kind: &str) -> OperonResult<RawResource> {
    let mut value =
        serde_json::to_value(typed).map_err(|err| OperonError::marshal("lifecycle object", err))?;
    if let Value::Object(map) = &mut value {
        map.insert("apiVersion".into(), Value::String(api_version.to_owned()));
        map.insert("kind".into(), Value::String(kind.to_owned()));
    }
    RawResource::from_value(value)
}
