//! Phase 2: business-rule validation over records that passed the schema.
//!
//! Checks run in a fixed order: `required`, `types`, `enums`, `ranges`, then
//! user-defined `rules`. Error-level failures fail the unit; warnings are
//! logged and pass.

use super::FailureError;
use crate::config::{BusinessRule, RuleLevel, RuleSet};
use crate::errors::ExprError;
use crate::expr::eval_predicate;
use serde_json::{Map, Value};

#[derive(Debug, Default)]
pub struct RuleOutcome {
    pub errors: Vec<FailureError>,
    pub warnings: Vec<FailureError>,
}

impl RuleOutcome {
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn apply_rules(rules: &RuleSet, record: &Map<String, Value>) -> RuleOutcome {
    let mut outcome = RuleOutcome::default();

    for field in &rules.required {
        let missing = match record.get(field) {
            None => true,
            Some(Value::Null) => true,
            Some(_) => false,
        };
        if missing {
            outcome.errors.push(FailureError {
                path: format!("/{field}"),
                rule: "required".to_string(),
                message: format!("required field '{field}' is missing or null"),
            });
        }
    }

    for (field, expected) in &rules.types {
        let Some(value) = record.get(field) else {
            continue;
        };
        if !type_matches(value, expected) {
            outcome.errors.push(FailureError {
                path: format!("/{field}"),
                rule: "types".to_string(),
                message: format!(
                    "field '{field}' expected {expected}, got {}",
                    crate::expr::type_name(value)
                ),
            });
        }
    }

    for (field, allowed) in &rules.enums {
        let Some(value) = record.get(field) else {
            continue;
        };
        if !enum_member(value, allowed) {
            outcome.errors.push(FailureError {
                path: format!("/{field}"),
                rule: "enums".to_string(),
                message: format!("field '{field}' value {value} not in {allowed:?}"),
            });
        }
    }

    for (field, [min, max]) in &rules.ranges {
        let Some(value) = record.get(field) else {
            continue;
        };
        let Some(number) = value.as_f64() else {
            outcome.errors.push(FailureError {
                path: format!("/{field}"),
                rule: "ranges".to_string(),
                message: format!("field '{field}' is not numeric"),
            });
            continue;
        };
        if number < *min || number > *max {
            outcome.errors.push(FailureError {
                path: format!("/{field}"),
                rule: "ranges".to_string(),
                message: format!("field '{field}' = {number} outside [{min}, {max}]"),
            });
        }
    }

    for rule in &rules.rules {
        apply_user_rule(rule, record, &mut outcome);
    }

    outcome
}

fn apply_user_rule(rule: &BusinessRule, record: &Map<String, Value>, outcome: &mut RuleOutcome) {
    // The `when` guard gates on field presence: a guard that references an
    // absent field simply skips the rule.
    if let Some(when) = &rule.when {
        match eval_predicate(when, record) {
            Ok(true) => {}
            Ok(false) => return,
            Err(ExprError::Undefined { .. }) => return,
            Err(e) => {
                outcome.errors.push(FailureError {
                    path: String::new(),
                    rule: rule_name(rule),
                    message: format!("bad 'when' guard: {e}"),
                });
                return;
            }
        }
    }

    let failure = match eval_predicate(&rule.rule, record) {
        Ok(true) => None,
        Ok(false) => Some(render_message(rule, record)),
        Err(e) => Some(format!("rule evaluation failed: {e}")),
    };

    if let Some(message) = failure {
        let error = FailureError {
            path: String::new(),
            rule: rule_name(rule),
            message,
        };
        match rule.level {
            RuleLevel::Error => outcome.errors.push(error),
            RuleLevel::Warning => outcome.warnings.push(error),
        }
    }
}

fn rule_name(rule: &BusinessRule) -> String {
    rule.name.clone().unwrap_or_else(|| rule.rule.clone())
}

/// `{field}` placeholders in the error template interpolate from the record.
fn render_message(rule: &BusinessRule, record: &Map<String, Value>) -> String {
    let template = rule
        .error
        .clone()
        .unwrap_or_else(|| format!("rule '{}' failed", rule.rule));
    let mut out = template;
    for (key, value) in record {
        let placeholder = format!("{{{key}}}");
        if out.contains(&placeholder) {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    out
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => false,
    }
}

fn enum_member(value: &Value, allowed: &[Value]) -> bool {
    allowed.iter().any(|member| match (member, value) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => a == b,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn ruleset(yaml: &str) -> RuleSet {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn required_rejects_missing_and_null() {
        let rules = ruleset("required: [name, score]");
        let outcome = apply_rules(&rules, &record(json!({"name": null})));
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors.iter().all(|e| e.rule == "required"));
    }

    #[test]
    fn types_and_ranges() {
        let rules = ruleset(
            r#"
types:
  score: number
ranges:
  score: [0, 10]
"#,
        );
        assert!(apply_rules(&rules, &record(json!({"score": 7}))).passed());
        assert!(!apply_rules(&rules, &record(json!({"score": "7"}))).passed());
        assert!(!apply_rules(&rules, &record(json!({"score": 11}))).passed());
        // Inclusive bounds.
        assert!(apply_rules(&rules, &record(json!({"score": 10}))).passed());
        assert!(apply_rules(&rules, &record(json!({"score": 0}))).passed());
    }

    #[test]
    fn enums_are_case_insensitive() {
        let rules = ruleset(
            r#"
enums:
  grade: [low, medium, high]
"#,
        );
        assert!(apply_rules(&rules, &record(json!({"grade": "MEDIUM"}))).passed());
        assert!(!apply_rules(&rules, &record(json!({"grade": "extreme"}))).passed());
    }

    #[test]
    fn user_rule_with_interpolated_error() {
        let rules = ruleset(
            r#"
rules:
  - rule: "score >= threshold"
    error: "score {score} below threshold {threshold}"
"#,
        );
        let outcome = apply_rules(&rules, &record(json!({"score": 3, "threshold": 5})));
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].message, "score 3 below threshold 5");
    }

    #[test]
    fn warning_level_passes_but_is_reported() {
        let rules = ruleset(
            r#"
rules:
  - rule: "len(summary) > 100"
    level: warning
    error: "summary is short"
"#,
        );
        let outcome = apply_rules(&rules, &record(json!({"summary": "brief"})));
        assert!(outcome.passed());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn when_guard_skips_on_absent_field() {
        let rules = ruleset(
            r#"
rules:
  - rule: "bonus >= 0"
    when: "bonus != None"
"#,
        );
        // Field absent: guard references it, rule is skipped.
        assert!(apply_rules(&rules, &record(json!({"other": 1}))).passed());
        // Field present and invalid: rule fires.
        assert!(!apply_rules(&rules, &record(json!({"bonus": -2}))).passed());
    }

    #[test]
    fn every_failure_has_path_and_rule_fields() {
        let rules = ruleset(
            r#"
required: [name]
rules:
  - rule: "1 == 2"
"#,
        );
        let outcome = apply_rules(&rules, &record(json!({})));
        for error in &outcome.errors {
            assert!(!error.rule.is_empty());
            // `path` may be empty for record-level rules but is always present.
        }
        assert_eq!(outcome.errors.len(), 2);
    }
}
