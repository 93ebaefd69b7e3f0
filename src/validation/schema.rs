//! Phase 1: strict JSON-Schema validation (Draft 2020-12), after coercion.
//!
//! Schemas must not forbid additional properties — the orchestrator injects
//! `unit_id` and `_metadata` on every record.

use super::FailureError;
use anyhow::{Context, Result};
use jsonschema::Validator;
use serde_json::Value;
use std::path::Path;

pub struct SchemaValidator {
    schema: Value,
    validator: Validator,
}

impl SchemaValidator {
    pub fn new(schema: Value) -> Result<Self> {
        let validator = jsonschema::draft202012::new(&schema)
            .map_err(|e| anyhow::anyhow!("Invalid schema: {e}"))?;
        Ok(Self { schema, validator })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read schema at {}", path.display()))?;
        let schema: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse schema at {}", path.display()))?;
        Self::new(schema)
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate one record. Empty vec means pass. Every error carries the
    /// JSON-pointer `path` of the offending value.
    pub fn validate(&self, record: &Value) -> Vec<FailureError> {
        self.validator
            .iter_errors(record)
            .map(|err| FailureError {
                path: err.instance_path().to_string(),
                rule: "schema".to_string(),
                message: err.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::new(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "age": {"type": "integer", "minimum": 0},
            },
            "required": ["name", "age"],
        }))
        .unwrap()
    }

    #[test]
    fn conformant_record_passes() {
        let errors = validator().validate(&json!({"name": "Ada", "age": 36}));
        assert!(errors.is_empty());
    }

    #[test]
    fn extra_properties_are_allowed() {
        // The orchestrator injects unit_id and _metadata on every record.
        let errors = validator().validate(&json!({
            "name": "Ada", "age": 36, "unit_id": "ada", "_metadata": {}
        }));
        assert!(errors.is_empty());
    }

    #[test]
    fn violations_carry_instance_paths() {
        let errors = validator().validate(&json!({"name": "Ada", "age": -1}));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, "/age");
        assert_eq!(errors[0].rule, "schema");
    }

    #[test]
    fn missing_required_field_reported() {
        let errors = validator().validate(&json!({"age": 3}));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("name"));
    }

    #[test]
    fn revalidation_is_idempotent() {
        let v = validator();
        let record = json!({"name": 7, "age": "x"});
        let first = v.validate(&record);
        let second = v.validate(&record);
        assert_eq!(first.len(), second.len());
        assert!(!first.is_empty());
    }

    #[test]
    fn bad_schema_is_rejected_at_construction() {
        assert!(SchemaValidator::new(json!({"type": 42})).is_err());
    }
}
