//! Lifecycle controllers.
//!
//! - `instance`: drives service instances through provision/update/delete
//! - `binding`: drives service bindings, including the credentials secret
//! - `retry`: bounded retry helper shared by both controllers
//! - `watch`: watch-list divergence reporting and restart supervision

pub mod binding;
pub mod instance;
pub mod retry;
pub mod watch;

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ApiVersionKind;
use crate::model::RawResource;

pub use binding::BindingController;
pub use instance::InstanceController;
pub use retry::with_retries;
pub use watch::{ControllerEvent, WatchReporter, WatchSupervisor};

/// Finalizer guarding lifecycle objects until teardown completes.
pub const FINALIZER: &str = "operon.io/lifecycle";

/// Label recording which desired state triggered the in-flight operation.
pub const LAST_OPERATION_LABEL: &str = "operon.io/last-operation";

/// Label carrying the consecutive-failure count.
pub const ERROR_COUNT_LABEL: &str = "operon.io/error-count";

/// Cluster identifier under which this process's own store is registered.
pub const OWN_CLUSTER_ID: &str = "1";

/// Consecutive-failure count, tolerating absent or mangled label values.
pub(crate) fn error_count(labels: &BTreeMap<String, String>) -> u32 {
    labels
        .get(ERROR_COUNT_LABEL)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// The distinct apiVersion/kind pairs a resource set spans, in stable order.
pub(crate) fn needed_watches(expected: &[RawResource]) -> Vec<ApiVersionKind> {
    let set: BTreeSet<ApiVersionKind> = expected
        .iter()
        .map(|resource| ApiVersionKind {
            api_version: resource.api_version().to_owned(),
            kind: resource.kind().to_owned(),
        })
        .collect();
    set.into_iter().collect()
}
