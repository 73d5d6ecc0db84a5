//! Chart engine: a packaged chart directory rendered to many files.
//!
//! A chart directory holds a `Chart.yaml` manifest, optional default values
//! in `values.yaml`, and templates under `templates/`. The plan template's
//! inline content, when present, is itself rendered first and deep-merged
//! over the default values; every chart template is then rendered against
//! the merged values. Output files are named `{chart_name}/{file_name}`.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tera::Tera;

use crate::errors::{OperonError, OperonResult};
use crate::merge::deep_update;
use crate::render::text::{TextRenderer, MAIN_FILE};
use crate::render::{RenderInput, RenderOutput, Renderer};

#[derive(Debug, Deserialize)]
struct ChartManifest {
    name: String,
    #[serde(default)]
    version: String,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChartRenderer {
    values_engine: TextRenderer,
}

impl ChartRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn load_manifest(chart_path: &Path) -> OperonResult<ChartManifest> {
        let manifest_path = chart_path.join("Chart.yaml");
        let raw = fs::read_to_string(&manifest_path).map_err(|err| {
            OperonError::renderer(
                "chart",
                format!("failed to read {}", manifest_path.display()),
                Some(Box::new(err)),
            )
        })?;
        serde_yaml::from_str(&raw).map_err(|err| {
            OperonError::renderer(
                "chart",
                format!("invalid chart manifest {}", manifest_path.display()),
                Some(Box::new(err)),
            )
        })
    }

    fn default_values(chart_path: &Path) -> OperonResult<Value> {
        let values_path = chart_path.join("values.yaml");
        if !values_path.exists() {
            return Ok(Value::Object(Map::new()));
        }
        let raw = fs::read_to_string(&values_path).map_err(|err| {
            OperonError::renderer(
                "chart",
                format!("failed to read {}", values_path.display()),
                Some(Box::new(err)),
            )
        })?;
        if raw.trim().is_empty() {
            return Ok(Value::Object(Map::new()));
        }
        serde_yaml::from_str(&raw).map_err(|err| {
            OperonError::renderer(
                "chart",
                format!("invalid default values {}", values_path.display()),
                Some(Box::new(err)),
            )
        })
    }

    /// Render the plan's values template and merge it over the defaults.
    fn resolve_values(&self, input: &RenderInput, chart_path: &Path) -> OperonResult<Value> {
        let mut values = Self::default_values(chart_path)?;
        if input.template.trim().is_empty() {
            return Ok(values);
        }
        let rendered = self.values_engine.render(input)?;
        let overrides: Value =
            serde_yaml::from_str(rendered.file_content(MAIN_FILE)?).map_err(|err| {
                OperonError::renderer(
                    "chart",
                    "values template did not render valid yaml",
                    Some(Box::new(err)),
                )
            })?;
        if overrides.is_null() {
            return Ok(values);
        }
        deep_update(&mut values, &overrides)?;
        Ok(values)
    }

    fn template_files(chart_path: &Path) -> OperonResult<Vec<(String, String)>> {
        let templates_dir = chart_path.join("templates");
        let entries = fs::read_dir(&templates_dir).map_err(|err| {
            OperonError::renderer(
                "chart",
                format!("failed to read {}", templates_dir.display()),
                Some(Box::new(err)),
            )
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                OperonError::renderer(
                    "chart",
                    format!("failed to read {}", templates_dir.display()),
                    Some(Box::new(err)),
                )
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            // Helpers and notes are not resource templates.
            if file_name.starts_with('_') || file_name == "NOTES.txt" {
                continue;
            }
            let content = fs::read_to_string(&path).map_err(|err| {
                OperonError::renderer(
                    "chart",
                    format!("failed to read {}", path.display()),
                    Some(Box::new(err)),
                )
            })?;
            files.push((file_name.to_owned(), content));
        }
        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }
}

impl Renderer for ChartRenderer {
    fn render(&self, input: &RenderInput) -> OperonResult<RenderOutput> {
        let chart_path = input
            .chart_path
            .as_deref()
            .ok_or_else(|| OperonError::input("chart render", "chart url is required"))?;

        let manifest = Self::load_manifest(chart_path)?;
        let values = self.resolve_values(input, chart_path)?;

        let mut context_values = input.values.clone();
        context_values.insert("values".into(), values);
        context_values.insert(
            "chart".into(),
            json!({"name": manifest.name, "version": manifest.version}),
        );
        context_values.insert(
            "release".into(),
            json!({"name": input.release_name, "namespace": input.release_namespace}),
        );
        let context =
            tera::Context::from_value(Value::Object(context_values)).map_err(|err| {
                OperonError::renderer(
                    "chart",
                    "failed to build render context",
                    Some(Box::new(err)),
                )
            })?;

        let files = Self::template_files(chart_path)?;
        let mut tera = Tera::default();
        for (name, content) in &files {
            tera.add_raw_template(name, content).map_err(|err| {
                OperonError::renderer(
                    "chart",
                    format!("failed to compile template {name}"),
                    Some(Box::new(err)),
                )
            })?;
        }

        let mut output = RenderOutput::default();
        for (name, _) in &files {
            let content = tera.render(name, &context).map_err(|err| {
                OperonError::renderer(
                    "chart",
                    format!("failed to execute template {name}"),
                    Some(Box::new(err)),
                )
            })?;
            output.insert(format!("{}/{}", manifest.name, name), content);
        }
        Ok(output)
    }
}
