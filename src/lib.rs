//! # operon
//!
//! Declarative orchestration core. A service catalog declares, per plan,
//! a set of templates; operon renders them into downstream resource
//! documents, reconciles those documents against live state with a
//! structural deep merge, and drives every service instance and binding
//! through an explicit lifecycle state machine.
//!
//! ## Modules
//!
//! - `model`: typed lifecycle objects, catalog types, loosely-typed
//!   resources, template documents
//! - `render`: the text and chart template engines
//! - `merge`: the structural deep-merge underpinning reconciliation
//! - `materialize`: render-input assembly and document production
//! - `status`: status computation from the plan's status template
//! - `reconcile`: create/merge/delete of downstream resources
//! - `controller`: the instance and binding state machines, retry and
//!   watch supervision
//! - `dispatch`: keyed worker pool driving the controllers
//! - `store`: the resource store abstraction and in-memory implementation
//! - `config`: runtime configuration

pub mod config;
pub mod controller;
pub mod dispatch;
pub mod errors;
pub mod materialize;
pub mod merge;
pub mod model;
pub mod reconcile;
pub mod render;
pub mod status;
pub mod store;

pub use config::{ApiVersionKind, OperonConfig};
pub use controller::{BindingController, InstanceController, WatchSupervisor};
pub use dispatch::Dispatcher;
pub use errors::{OperonError, OperonResult};
pub use materialize::{MaterializeRequest, Materializer};
pub use merge::deep_update;
pub use model::{
    LifecycleState, ObjectKey, RawResource, ResourceKey, ServiceBinding, ServiceInstance,
};
pub use reconcile::Reconciler;
pub use store::{ClusterRegistry, MemoryStore, ResourceStore, StaticRegistry, StoreError};
