//! Error taxonomy for the orchestration core.
//!
//! Every fallible operation in the crate funnels into [`OperonError`]. The
//! variants are deliberately coarse: controllers branch on *classes* of
//! failure (not found, malformed request, renderer failure) through the
//! predicate helpers rather than on individual variants, so downstream code
//! stays insulated from taxonomy growth.

use thiserror::Error;

use crate::store::StoreError;

/// Convenience alias used throughout the crate.
pub type OperonResult<T> = Result<T, OperonError>;

/// Unified error type for rendering, materialization and lifecycle control.
#[derive(Debug, Error)]
pub enum OperonError {
    /// Service offering lookup failed.
    #[error("service offering {0} not found")]
    OfferingNotFound(String),

    /// Service plan lookup failed.
    #[error("service plan {0} not found")]
    PlanNotFound(String),

    /// Service instance lookup failed.
    #[error("service instance {0} not found")]
    InstanceNotFound(String),

    /// Service binding lookup failed.
    #[error("service binding {0} not found")]
    BindingNotFound(String),

    /// A plan does not carry a template for the requested action.
    #[error("plan {plan_id} has no template for action {action}")]
    TemplateNotFound { plan_id: String, action: String },

    /// A rendered output does not contain the requested file.
    #[error("rendered output has no file named {0}")]
    RenderedFileNotFound(String),

    /// Serializing a value failed.
    #[error("failed to marshal {context}")]
    Marshal {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Deserializing a document failed.
    #[error("failed to unmarshal {context}: {reason}")]
    Unmarshal { context: String, reason: String },

    /// A value has the wrong shape for the requested conversion.
    #[error("conversion failed: {0}")]
    Convert(String),

    /// A template engine failed to load, compile or execute a template.
    #[error("{engine} renderer: {message}")]
    Renderer {
        engine: &'static str,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid input handed to an operation (bad base64, missing content, ...).
    #[error("invalid input to {operation}: {message}")]
    Input { operation: String, message: String },

    /// A status write raced with a state change and was abandoned.
    #[error("precondition for {operation} not met: {message}")]
    Precondition { operation: String, message: String },

    /// Configuration could not be loaded or deserialized.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failure surfaced by the resource store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OperonError {
    pub fn marshal(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Marshal {
            context: context.into(),
            source,
        }
    }

    pub fn unmarshal(context: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unmarshal {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub fn renderer(
        engine: &'static str,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Renderer {
            engine,
            message: message.into(),
            source,
        }
    }

    pub fn input(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Input {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn precondition(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Precondition {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for the typed not-found family (offering, plan, instance,
    /// binding, template) and for store-level not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::OfferingNotFound(_)
                | Self::PlanNotFound(_)
                | Self::InstanceNotFound(_)
                | Self::BindingNotFound(_)
                | Self::TemplateNotFound { .. }
                | Self::Store(StoreError::NotFound(_))
        )
    }

    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound(_))
    }

    pub fn is_template_not_found(&self) -> bool {
        matches!(self, Self::TemplateNotFound { .. })
    }

    /// True when the underlying store rejected the request as structurally
    /// invalid. These failures can never heal on retry, so the lifecycle
    /// controllers mark the object failed immediately.
    pub fn is_malformed_request(&self) -> bool {
        matches!(self, Self::Store(StoreError::MalformedRequest { .. }))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict(_)))
    }

    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::Precondition { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKey;

    // ---- predicate classification ----

    #[test]
    fn not_found_family_is_classified() {
        assert!(OperonError::OfferingNotFound("svc".into()).is_not_found());
        assert!(OperonError::PlanNotFound("plan".into()).is_not_found());
        assert!(OperonError::InstanceNotFound("i1".into()).is_not_found());
        assert!(OperonError::BindingNotFound("b1".into()).is_not_found());
        assert!(OperonError::TemplateNotFound {
            plan_id: "plan".into(),
            action: "provision".into(),
        }
        .is_not_found());
        assert!(!OperonError::Convert("nope".into()).is_not_found());
    }

    #[test]
    fn store_not_found_is_not_found() {
        let key = ResourceKey::new("apps/v1", "Deployment", "default", "web");
        assert!(OperonError::from(StoreError::NotFound(key)).is_not_found());
    }

    #[test]
    fn malformed_request_is_terminal_class() {
        let key = ResourceKey::new("apps/v1", "Deployment", "default", "web");
        let err = OperonError::from(StoreError::MalformedRequest {
            key,
            message: "spec.replicas must be an integer".into(),
        });
        assert!(err.is_malformed_request());
        assert!(!err.is_not_found());
    }

    #[test]
    fn instance_not_found_is_narrower_than_not_found() {
        let err = OperonError::BindingNotFound("b1".into());
        assert!(err.is_not_found());
        assert!(!err.is_instance_not_found());
    }

    // ---- display ----

    #[test]
    fn display_carries_identifiers() {
        let err = OperonError::TemplateNotFound {
            plan_id: "plan-a".into(),
            action: "bind".into(),
        };
        assert_eq!(
            err.to_string(),
            "plan plan-a has no template for action bind"
        );
    }

    #[test]
    fn renderer_error_keeps_source() {
        let tera_err = tera::Tera::default()
            .render("missing", &tera::Context::new())
            .unwrap_err();
        let err = OperonError::renderer("text", "render failed", Some(Box::new(tera_err)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
