//! `--validate-config`: offline pipeline config check.

use crate::config::PipelineConfig;
use crate::config::validate::validate_config;
use anyhow::{Context, Result};
use console::style;
use std::path::Path;

pub fn cmd_validate_config(config_path: &Path) -> Result<i32> {
    let config = PipelineConfig::load(config_path)?;
    let config_dir = config_path
        .parent()
        .context("Config path has no parent directory")?;
    let report = validate_config(&config, config_dir)?;

    println!(
        "pipeline '{}': {} step(s)",
        config.pipeline.name,
        config.pipeline.steps.len()
    );
    for step in &config.pipeline.steps {
        let kind = match step.scope {
            crate::config::StageScope::Llm => "llm",
            crate::config::StageScope::Expression => "expression",
            crate::config::StageScope::Run => "run",
        };
        let mut links = Vec::new();
        if step.is_llm() {
            links.push(if config.prompts.templates.contains_key(&step.name) {
                "template"
            } else {
                "template:MISSING"
            });
            links.push(if config.schemas.files.contains_key(&step.name) {
                "schema"
            } else {
                "schema:MISSING"
            });
            links.push(if config.validation.contains_key(&step.name) {
                "validation"
            } else {
                "validation:MISSING"
            });
        }
        println!("  {:<20} {:<10} {}", step.name, kind, links.join(" "));
    }

    for warning in &report.warnings {
        println!("{} {warning}", style("warning:").yellow());
    }
    for error in &report.errors {
        println!("{} {error}", style("error:").red());
    }

    if report.ok() {
        println!("{}", style("config ok").green());
        Ok(0)
    } else {
        println!(
            "{}",
            style(format!("{} error(s)", report.errors.len())).red()
        );
        Ok(1)
    }
}
