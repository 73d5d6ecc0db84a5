//! Typed domain model.
//!
//! - `object`: lifecycle objects (service instances and bindings) plus the
//!   [`LifecycleState`] machine vocabulary shared by the controllers
//! - `plan`: the service catalog side (offerings, plans, templates)
//! - `resource`: loosely-typed downstream resources ([`RawResource`])
//! - `properties`: sources/status documents produced by plan templates

pub mod object;
pub mod plan;
pub mod properties;
pub mod resource;

pub use object::{
    LifecycleState, ObjectKey, ObjectMeta, OwnerReference, ServiceBinding, ServiceInstance, Source,
};
pub use plan::{Action, ServiceOffering, ServicePlan, TemplateEngine, TemplateSpec};
pub use properties::{ActionStatus, StatusDoc};
pub use resource::{RawResource, ResourceKey};
