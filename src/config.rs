//! Runtime configuration.
//!
//! Loaded from an optional file plus `OPERON_`-prefixed environment
//! variables (`OPERON_ERROR_THRESHOLD=5`, nested keys separated by `__`).
//! Every field has a default so an empty environment yields a working
//! configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{OperonError, OperonResult};

/// An apiVersion/kind pair a controller watches.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersionKind {
    pub api_version: String,
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperonConfig {
    /// Concurrent reconcile passes for service instances.
    pub instance_worker_count: usize,
    /// Concurrent reconcile passes for service bindings.
    pub binding_worker_count: usize,
    /// Consecutive failures after which an object is marked failed.
    pub error_threshold: u32,
    /// Attempts for read-modify-write cycles against the store.
    pub write_attempts: u32,
    /// Namespace holding service offerings and plans.
    pub services_namespace: String,
    /// Quiet window before a restart decision is emitted.
    pub restart_debounce_ms: u64,
    /// Downstream kinds the instance controller currently watches.
    pub instance_watch_list: Vec<ApiVersionKind>,
    /// Downstream kinds the binding controller currently watches.
    pub binding_watch_list: Vec<ApiVersionKind>,
}

impl Default for OperonConfig {
    fn default() -> Self {
        Self {
            instance_worker_count: 10,
            binding_worker_count: 20,
            error_threshold: 10,
            write_attempts: 4,
            services_namespace: "operon-services".into(),
            restart_debounce_ms: 5_000,
            instance_watch_list: Vec::new(),
            binding_watch_list: Vec::new(),
        }
    }
}

impl OperonConfig {
    /// Load configuration from `path` (when given) layered under
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> OperonResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("OPERON").separator("__"),
        );
        let raw = builder
            .build()
            .map_err(|err| OperonError::Config(err.to_string()))?;
        raw.try_deserialize()
            .map_err(|err| OperonError::Config(err.to_string()))
    }

    pub fn restart_debounce(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_complete() {
        let config = OperonConfig::default();
        assert_eq!(config.instance_worker_count, 10);
        assert_eq!(config.binding_worker_count, 20);
        assert_eq!(config.error_threshold, 10);
        assert_eq!(config.services_namespace, "operon-services");
        assert!(config.instance_watch_list.is_empty());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "error_threshold: 3\nservices_namespace: catalog\ninstance_watch_list:\n  - apiVersion: apps/v1\n    kind: Deployment\n"
        )
        .unwrap();

        let config = OperonConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.services_namespace, "catalog");
        assert_eq!(config.instance_watch_list.len(), 1);
        // Untouched fields keep their defaults.
        assert_eq!(config.binding_worker_count, 20);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = OperonConfig::load(Some(Path::new("/does/not/exist.yaml"))).unwrap_err();
        assert!(matches!(err, OperonError::Config(_)));
    }
}
