//! Text engine: one inline Tera template rendered to a single `main` file.

use tera::{Context, Tera};

use crate::errors::{OperonError, OperonResult};
use crate::render::{RenderInput, RenderOutput, Renderer};

/// Output file name used by the text engine.
pub const MAIN_FILE: &str = "main";

#[derive(Clone, Copy, Debug, Default)]
pub struct TextRenderer;

impl TextRenderer {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn context_for(input: &RenderInput) -> OperonResult<Context> {
        let mut values = input.values.clone();
        values.insert(
            "release".into(),
            serde_json::json!({
                "name": input.release_name,
                "namespace": input.release_namespace,
            }),
        );
        Context::from_value(serde_json::Value::Object(values)).map_err(|err| {
            OperonError::renderer("text", "failed to build render context", Some(Box::new(err)))
        })
    }
}

impl Renderer for TextRenderer {
    fn render(&self, input: &RenderInput) -> OperonResult<RenderOutput> {
        let mut tera = Tera::default();
        tera.add_raw_template(MAIN_FILE, &input.template)
            .map_err(|err| {
                OperonError::renderer("text", "failed to compile template", Some(Box::new(err)))
            })?;

        let context = Self::context_for(input)?;
        let content = tera.render(MAIN_FILE, &context).map_err(|err| {
            OperonError::renderer("text", "failed to execute template", Some(Box::new(err)))
        })?;

        let mut output = RenderOutput::default();
        output.insert(MAIN_FILE, content);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(template: &str) -> RenderInput {
        let mut values = serde_json::Map::new();
        values.insert("instance".into(), json!({"metadata": {"name": "i1"}}));
        RenderInput {
            template: template.into(),
            chart_path: None,
            release_name: "i1".into(),
            release_namespace: "default".into(),
            values,
        }
    }

    // ---- happy path ----

    #[test]
    fn renders_exactly_one_main_file() {
        let output = TextRenderer::new()
            .render(&input("name: {{ instance.metadata.name }}"))
            .unwrap();
        assert_eq!(output.files().collect::<Vec<_>>(), vec![MAIN_FILE]);
        assert_eq!(output.file_content(MAIN_FILE).unwrap(), "name: i1");
    }

    #[test]
    fn release_identity_is_available() {
        let output = TextRenderer::new()
            .render(&input("{{ release.name }}/{{ release.namespace }}"))
            .unwrap();
        assert_eq!(output.file_content(MAIN_FILE).unwrap(), "i1/default");
    }

    #[test]
    fn other_file_names_are_not_found() {
        let output = TextRenderer::new().render(&input("hi")).unwrap();
        let err = output.file_content("nonmain").unwrap_err();
        assert!(matches!(err, OperonError::RenderedFileNotFound(name) if name == "nonmain"));
    }

    // ---- failures ----

    #[test]
    fn compile_errors_are_renderer_errors() {
        let err = TextRenderer::new()
            .render(&input("{{ unclosed"))
            .unwrap_err();
        assert!(matches!(err, OperonError::Renderer { engine: "text", .. }));
    }

    #[test]
    fn undefined_variables_fail_execution() {
        let err = TextRenderer::new()
            .render(&input("{{ no_such_value }}"))
            .unwrap_err();
        assert!(matches!(err, OperonError::Renderer { engine: "text", .. }));
    }
}
