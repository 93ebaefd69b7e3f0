//! Per-unit prompt rendering.
//!
//! Each LLM stage has a template file; the render context is the unit's
//! accumulated fields (the stage input, which carries everything prior
//! stages validated) merged over the pipeline's `global_context`.

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior, path_loader};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

pub struct Renderer {
    env: Environment<'static>,
    templates: BTreeMap<String, String>,
    global_context: BTreeMap<String, Value>,
}

impl Renderer {
    /// `template_dir` is the snapshotted directory inside the run's config.
    pub fn new(
        template_dir: &Path,
        templates: BTreeMap<String, String>,
        global_context: BTreeMap<String, Value>,
    ) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(template_dir));
        // Typos in templates should fail the render, not emit empty strings.
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env,
            templates,
            global_context,
        }
    }

    pub fn has_template(&self, stage: &str) -> bool {
        self.templates.contains_key(stage)
    }

    /// Render the prompt for one unit at one stage.
    pub fn render(&self, stage: &str, stage_input: &Map<String, Value>) -> Result<String> {
        let file = self
            .templates
            .get(stage)
            .with_context(|| format!("No template configured for stage '{stage}'"))?;
        let template = self
            .env
            .get_template(file)
            .with_context(|| format!("Failed to load template '{file}' for stage '{stage}'"))?;

        let mut context = Map::new();
        for (key, value) in &self.global_context {
            context.insert(key.clone(), value.clone());
        }
        for (key, value) in stage_input {
            context.insert(key.clone(), value.clone());
        }

        template
            .render(Value::Object(context))
            .with_context(|| format!("Failed to render template '{file}' for stage '{stage}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(template: &str) -> (Renderer, TempDir) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("generate.j2"), template).unwrap();
        let mut templates = BTreeMap::new();
        templates.insert("generate".to_string(), "generate.j2".to_string());
        let mut global = BTreeMap::new();
        global.insert("tone".to_string(), json!("formal"));
        let renderer = Renderer::new(dir.path(), templates, global);
        (renderer, dir)
    }

    fn unit() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("unit_id".to_string(), json!("ada"));
        m.insert("name".to_string(), json!("Ada Lovelace"));
        m
    }

    #[test]
    fn renders_unit_fields_and_global_context() {
        let (renderer, _dir) = setup("Write a {{ tone }} profile of {{ name }}.");
        let prompt = renderer.render("generate", &unit()).unwrap();
        assert_eq!(prompt, "Write a formal profile of Ada Lovelace.");
    }

    #[test]
    fn unit_fields_shadow_global_context() {
        let (renderer, _dir) = setup("{{ tone }}");
        let mut input = unit();
        input.insert("tone".to_string(), json!("casual"));
        assert_eq!(renderer.render("generate", &input).unwrap(), "casual");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let (renderer, _dir) = setup("{{ missing_field }}");
        assert!(renderer.render("generate", &unit()).is_err());
    }

    #[test]
    fn unconfigured_stage_is_an_error() {
        let (renderer, _dir) = setup("x");
        assert!(renderer.render("score", &unit()).is_err());
    }

    #[test]
    fn accumulated_fields_from_prior_stages_are_visible() {
        let (renderer, _dir) = setup("Score this: {{ summary }}");
        let mut input = unit();
        input.insert("summary".to_string(), json!("A pioneer of computing."));
        let prompt = renderer.render("generate", &input).unwrap();
        assert!(prompt.contains("A pioneer of computing."));
    }
}
