//! Loosely-typed downstream resources.
//!
//! Rendered templates produce arbitrary resource documents whose schema the
//! orchestrator does not know. [`RawResource`] wraps such a document as a
//! JSON object tree and exposes just the metadata the reconciler needs:
//! identity, labels, owner references and the status subtree touched by
//! soft deletion.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{OperonError, OperonResult};
use crate::model::object::OwnerReference;

/// Fully-qualified identity of a stored resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}/{}/{}",
            self.kind, self.api_version, self.namespace, self.name
        )
    }
}

/// A resource document as rendered or as stored: a JSON object tree with
/// `apiVersion`, `kind` and a `metadata` object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawResource {
    body: Value,
}

impl RawResource {
    /// Build an empty resource shell with identity fields set.
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut resource = Self {
            body: Value::Object(Map::new()),
        };
        resource.set_str(&["apiVersion"], api_version);
        resource.set_str(&["kind"], kind);
        resource.set_str(&["metadata", "namespace"], namespace);
        resource.set_str(&["metadata", "name"], name);
        resource
    }

    /// Wrap a decoded document. The value must be a JSON object.
    pub fn from_value(value: Value) -> OperonResult<Self> {
        match value {
            Value::Object(_) => Ok(Self { body: value }),
            other => Err(OperonError::Convert(format!(
                "resource document must be a mapping, got {}",
                value_kind(&other)
            ))),
        }
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Value {
        &mut self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }

    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"])
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"])
    }

    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        self.set_str(&["metadata", "namespace"], namespace);
    }

    pub fn uid(&self) -> &str {
        self.str_at(&["metadata", "uid"])
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.set_str(&["metadata", "uid"], uid);
    }

    pub fn resource_version(&self) -> &str {
        self.str_at(&["metadata", "resourceVersion"])
    }

    pub fn set_resource_version(&mut self, version: &str) {
        self.set_str(&["metadata", "resourceVersion"], version);
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            self.api_version(),
            self.kind(),
            self.namespace(),
            self.name(),
        )
    }

    /// Labels as stored, or an empty map when absent or malformed.
    pub fn labels(&self) -> Map<String, Value> {
        match self.at(&["metadata", "labels"]) {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.at(&["metadata", "labels", name])
            .and_then(Value::as_str)
    }

    pub fn finalizers(&self) -> Vec<String> {
        match self.at(&["metadata", "finalizers"]) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.at(&["metadata", "deletionTimestamp"])
            .and_then(Value::as_str)
    }

    pub fn set_deletion_timestamp(&mut self, stamp: &str) {
        self.set_str(&["metadata", "deletionTimestamp"], stamp);
    }

    /// Replace the owner references with the given controller owner.
    pub fn set_owner_reference(&mut self, owner: &OwnerReference) -> OperonResult<()> {
        let refs = serde_json::to_value(vec![owner])
            .map_err(|err| OperonError::marshal("owner reference", err))?;
        self.set(&["metadata", "ownerReferences"], refs);
        Ok(())
    }

    /// The `status` subtree as a mutable mapping, created when absent.
    /// Errors when `status` exists with a non-mapping shape.
    pub fn status_object_mut(&mut self) -> OperonResult<&mut Map<String, Value>> {
        let root = self.object_mut();
        let status = root
            .entry("status".to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        match status {
            Value::Object(map) => Ok(map),
            other => Err(OperonError::Convert(format!(
                "status must be a mapping, got {}",
                value_kind(other)
            ))),
        }
    }

    fn object_mut(&mut self) -> &mut Map<String, Value> {
        match &mut self.body {
            Value::Object(map) => map,
            // Constructors guarantee an object body.
            other => {
                *other = Value::Object(Map::new());
                match other {
                    Value::Object(map) => map,
                    _ => unreachable!("body was just replaced with an object"),
                }
            }
        }
    }

    fn at(&self, path: &[&str]) -> Option<&Value> {
        let mut node = &self.body;
        for segment in path {
            node = node.as_object()?.get(*segment)?;
        }
        Some(node)
    }

    fn str_at(&self, path: &[&str]) -> &str {
        self.at(path).and_then(Value::as_str).unwrap_or_default()
    }

    fn set(&mut self, path: &[&str], value: Value) {
        let mut node = self.object_mut();
        for segment in &path[..path.len() - 1] {
            let slot = node
                .entry((*segment).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            node = match slot {
                Value::Object(map) => map,
                _ => unreachable!("slot was just replaced with an object"),
            };
        }
        if let Some(last) = path.last() {
            node.insert((*last).to_owned(), value);
        }
    }

    fn set_str(&mut self, path: &[&str], value: &str) {
        self.set(path, Value::String(value.to_owned()));
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}
