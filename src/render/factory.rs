//! Engine selection and renderer-input construction.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::errors::{OperonError, OperonResult};
use crate::model::{TemplateEngine, TemplateSpec};
use crate::render::{ChartRenderer, RenderInput, Renderer, TextRenderer};

/// The engine implementation for a template's declared type.
pub fn renderer_for(engine: TemplateEngine) -> Box<dyn Renderer> {
    match engine {
        TemplateEngine::Text => Box::new(TextRenderer::new()),
        TemplateEngine::Chart => Box::new(ChartRenderer::new()),
    }
}

/// Build the [`RenderInput`] for a plan template.
///
/// Literal `content` wins over `content_encoded`; invalid base64 is fatal
/// for every engine. The text engine requires content; the chart engine
/// requires a `url` and treats content as an optional values template.
pub fn renderer_input(
    template: &TemplateSpec,
    release_name: &str,
    release_namespace: &str,
    values: Map<String, Value>,
) -> OperonResult<RenderInput> {
    let content = resolve_content(template)?;

    let (template_content, chart_path) = match template.engine {
        TemplateEngine::Text => {
            let content = content.ok_or_else(|| {
                OperonError::input(
                    "renderer input",
                    format!("{} template has no content", template.action),
                )
            })?;
            (content, None)
        }
        TemplateEngine::Chart => {
            let url = template.url.as_deref().filter(|url| !url.is_empty()).ok_or_else(|| {
                OperonError::input(
                    "renderer input",
                    format!("{} chart template has no url", template.action),
                )
            })?;
            (content.unwrap_or_default(), Some(PathBuf::from(url)))
        }
    };

    Ok(RenderInput {
        template: template_content,
        chart_path,
        release_name: release_name.to_owned(),
        release_namespace: release_namespace.to_owned(),
        values,
    })
}

fn resolve_content(template: &TemplateSpec) -> OperonResult<Option<String>> {
    if let Some(content) = template.content.as_deref() {
        if !content.is_empty() {
            return Ok(Some(content.to_owned()));
        }
    }
    if let Some(encoded) = template.content_encoded.as_deref() {
        if !encoded.is_empty() {
            let bytes = BASE64.decode(encoded).map_err(|err| {
                OperonError::input(
                    "renderer input",
                    format!("invalid base64 template content: {err}"),
                )
            })?;
            let decoded = String::from_utf8(bytes).map_err(|err| {
                OperonError::input(
                    "renderer input",
                    format!("template content is not utf-8: {err}"),
                )
            })?;
            return Ok(Some(decoded));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Action;

    fn text_template() -> TemplateSpec {
        TemplateSpec::literal(Action::Provision, "kind: ConfigMap")
    }

    // ---- content resolution ----

    #[test]
    fn literal_content_wins_over_encoded() {
        let mut template = text_template();
        template.content_encoded = Some(BASE64.encode("kind: Secret"));
        let input = renderer_input(&template, "i1", "default", Map::new()).unwrap();
        assert_eq!(input.template, "kind: ConfigMap");
    }

    #[test]
    fn encoded_content_is_decoded() {
        let mut template = text_template();
        template.content = None;
        template.content_encoded = Some(BASE64.encode("kind: Secret"));
        let input = renderer_input(&template, "i1", "default", Map::new()).unwrap();
        assert_eq!(input.template, "kind: Secret");
    }

    #[test]
    fn invalid_base64_fails_for_every_engine() {
        for engine in [TemplateEngine::Text, TemplateEngine::Chart] {
            let template = TemplateSpec {
                action: Action::Provision,
                engine,
                url: Some("./chart".into()),
                content: None,
                content_encoded: Some("%%% not base64 %%%".into()),
            };
            let err = renderer_input(&template, "i1", "default", Map::new()).unwrap_err();
            assert!(matches!(err, OperonError::Input { .. }), "engine {engine}");
        }
    }

    #[test]
    fn text_template_without_content_is_rejected() {
        let template = TemplateSpec {
            action: Action::Provision,
            engine: TemplateEngine::Text,
            url: None,
            content: None,
            content_encoded: None,
        };
        assert!(renderer_input(&template, "i1", "default", Map::new()).is_err());
    }

    #[test]
    fn chart_template_requires_url_but_not_content() {
        let mut template = TemplateSpec {
            action: Action::Provision,
            engine: TemplateEngine::Chart,
            url: Some("./charts/db".into()),
            content: None,
            content_encoded: None,
        };
        let input = renderer_input(&template, "i1", "default", Map::new()).unwrap();
        assert_eq!(input.template, "");
        assert_eq!(input.chart_path.as_deref().unwrap().to_str(), Some("./charts/db"));

        template.url = None;
        assert!(renderer_input(&template, "i1", "default", Map::new()).is_err());
    }

    // ---- engine dispatch ----

    #[test]
    fn renderer_for_is_exhaustive_over_engines() {
        let input = renderer_input(&text_template(), "i1", "default", Map::new()).unwrap();
        let output = renderer_for(TemplateEngine::Text).render(&input).unwrap();
        assert_eq!(output.file_content("main").unwrap(), "kind: ConfigMap");
    }
}
