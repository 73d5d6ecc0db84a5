//! Template rendering.
//!
//! A [`Renderer`] turns a [`RenderInput`] into a named set of rendered files.
//! Two engines exist, selected by the plan template's declared
//! [`TemplateEngine`](crate::model::TemplateEngine): `text` (one inline
//! template, one output file) and `chart` (a packaged chart directory with
//! default values and many templates).

pub mod chart;
pub mod factory;
pub mod text;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::errors::{OperonError, OperonResult};

pub use chart::ChartRenderer;
pub use factory::{renderer_for, renderer_input};
pub use text::TextRenderer;

/// Everything an engine needs for one render pass.
#[derive(Clone, Debug, Default)]
pub struct RenderInput {
    /// Resolved template content. For the chart engine this is the values
    /// template (may be empty); for the text engine it is the template
    /// itself.
    pub template: String,
    /// Chart directory, chart engine only.
    pub chart_path: Option<PathBuf>,
    /// Release identity exposed to templates as `release.name` /
    /// `release.namespace`.
    pub release_name: String,
    pub release_namespace: String,
    /// Input objects keyed by role (`service`, `plan`, `instance`,
    /// `binding`) plus resolved source objects.
    pub values: Map<String, Value>,
}

/// Named rendered files.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderOutput {
    files: BTreeMap<String, String>,
}

impl RenderOutput {
    pub(crate) fn insert(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.files.insert(name.into(), content.into());
    }

    /// File names in stable (lexicographic) order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content of a named file; unknown names are a typed not-found error.
    pub fn file_content(&self, name: &str) -> OperonResult<&str> {
        self.files
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| OperonError::RenderedFileNotFound(name.to_owned()))
    }
}

/// A template engine.
pub trait Renderer: Send + Sync {
    fn render(&self, input: &RenderInput) -> OperonResult<RenderOutput>;
}
