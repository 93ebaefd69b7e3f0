//! Two-phase response validation.
//!
//! Phase 1 coerces then schema-validates; Phase 2 applies business rules.
//! The phases run sequentially as separate tasks communicating over bounded
//! channels: phase 1 runs to completion and its output is collected before
//! phase 2 starts. Piping the phases in parallel deadlocks once a batch
//! outgrows the buffer, so sequential collection is the contract here.
//!
//! Failure categories:
//! - `schema_validation` — phase 1 rejected after coercion (retryable)
//! - `validation` — phase 2 rejected (retryable)
//! - `pipeline_internal` — no response, non-JSON text, upstream loss (not
//!   retryable)

mod coerce;
mod rules;
mod schema;

pub use coerce::{CoercionTrace, coerce_record, strip_trailing_commas};
pub use rules::{RuleOutcome, apply_rules};
pub use schema::SchemaValidator;

use crate::config::RuleSet;
use crate::util::strip_markdown_fences;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Channel capacity between validation phases. Small on purpose: the
/// collector drains phase 1 to completion, so capacity only smooths
/// scheduling, it never needs to hold a whole batch.
const PHASE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    SchemaValidation,
    Validation,
    PipelineInternal,
}

impl FailureStage {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SchemaValidation | Self::Validation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureError {
    /// JSON pointer for schema errors; may be empty for record-level rules.
    pub path: String,
    /// Rule name for business errors; "schema" for phase-1 errors.
    pub rule: String,
    pub message: String,
}

/// Persisted description of why a unit did not validate at a stage.
/// `raw_response` is captured before any parsing or merging — it is the
/// ground truth for re-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub unit_id: String,
    pub failure_stage: FailureStage,
    pub stage_input: Value,
    pub raw_response: String,
    pub errors: Vec<FailureError>,
    #[serde(default)]
    pub retry_count: u32,
}

/// One provider response awaiting validation.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub unit_id: String,
    pub stage_input: Map<String, Value>,
    /// The untouched response text; `None` when the provider reported an
    /// error for this unit.
    pub content: Option<String>,
    pub error: Option<String>,
}

/// Output of validating a stage's responses for one chunk.
#[derive(Debug, Default)]
pub struct StageValidation {
    pub validated: Vec<Map<String, Value>>,
    pub failures: Vec<FailureRecord>,
    pub warnings: Vec<(String, FailureError)>,
    pub coercions: Vec<(String, CoercionTrace)>,
}

struct Phase1Item {
    unit_id: String,
    stage_input: Map<String, Value>,
    raw_response: String,
    record: Map<String, Value>,
    coercions: Vec<CoercionTrace>,
    schema_errors: Vec<FailureError>,
}

/// Validate a chunk's responses against a stage's schema and rules.
///
/// `budget` is the total wall clock for both phases; whatever phase 1 leaves
/// unspent carries into phase 2. Units the budget ran out on become
/// `pipeline_internal` failures — never silent drops.
pub async fn validate_stage(
    responses: Vec<ResponseRecord>,
    schema: Option<&SchemaValidator>,
    rules: Option<&RuleSet>,
    budget: Duration,
    retry_count: u32,
) -> Result<StageValidation> {
    let mut out = StageValidation::default();
    let deadline = Instant::now() + budget;
    let all_inputs: Vec<(String, Map<String, Value>)> = responses
        .iter()
        .map(|r| (r.unit_id.clone(), r.stage_input.clone()))
        .collect();

    // Pre-phase: parse every response into a mergeable record. Parse
    // problems are pipeline_internal, not schema failures.
    let mut parsed: Vec<(String, Map<String, Value>, String, Map<String, Value>)> = Vec::new();
    for response in responses {
        let ResponseRecord {
            unit_id,
            stage_input,
            content,
            error,
        } = response;
        let raw = match (&content, &error) {
            (Some(text), _) => text.clone(),
            (None, Some(message)) => {
                let mut failure = internal_failure(
                    &unit_id,
                    &stage_input,
                    String::new(),
                    format!("provider error: {message}"),
                    retry_count,
                );
                // Distinct rule name so callers can route provider-call
                // failures (retryable) apart from other internal ones.
                failure.errors[0].rule = "provider".to_string();
                out.failures.push(failure);
                continue;
            }
            (None, None) => {
                out.failures.push(internal_failure(
                    &unit_id,
                    &stage_input,
                    String::new(),
                    "no response for unit".to_string(),
                    retry_count,
                ));
                continue;
            }
        };

        match parse_response(&raw) {
            Ok(body) => parsed.push((unit_id, stage_input, raw, body)),
            Err(message) => {
                out.failures.push(internal_failure(
                    &unit_id, &stage_input, raw, message, retry_count,
                ));
            }
        }
    }

    // Phase 1: coercion + schema, collected to completion over a bounded
    // channel before phase 2 starts.
    let validator = match schema {
        Some(s) => Some(SchemaValidator::new(s.schema().clone())?),
        None => None,
    };
    let (tx, mut rx) = mpsc::channel::<Phase1Item>(PHASE_CHANNEL_CAPACITY);
    let expected = parsed.len();
    let phase1 = tokio::spawn(async move {
        for (unit_id, stage_input, raw, body) in parsed {
            let mut record = merge_record(&unit_id, &stage_input, body);
            let coercions = match validator.as_ref() {
                Some(v) => coerce_record(&mut record, v.schema()),
                None => Vec::new(),
            };
            let schema_errors = match validator.as_ref() {
                Some(v) => v.validate(&Value::Object(record.clone())),
                None => Vec::new(),
            };
            let item = Phase1Item {
                unit_id,
                stage_input,
                raw_response: raw,
                record,
                coercions,
                schema_errors,
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let mut phase1_items: Vec<Phase1Item> = Vec::with_capacity(expected);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(item)) => phase1_items.push(item),
            Ok(None) => break,
            Err(_) => {
                phase1.abort();
                break;
            }
        }
    }
    let _ = phase1.await;

    let mut passed_phase1: Vec<Phase1Item> = Vec::new();
    for item in phase1_items {
        for trace in &item.coercions {
            out.coercions.push((item.unit_id.clone(), trace.clone()));
        }
        if item.schema_errors.is_empty() {
            passed_phase1.push(item);
        } else {
            out.failures.push(FailureRecord {
                unit_id: item.unit_id,
                failure_stage: FailureStage::SchemaValidation,
                stage_input: Value::Object(item.stage_input),
                raw_response: item.raw_response,
                errors: item.schema_errors,
                retry_count,
            });
        }
    }

    // Phase 2: business rules over phase-1 passes, same collection
    // discipline, spending whatever budget remains.
    match rules {
        None => {
            out.validated = passed_phase1.into_iter().map(|i| i.record).collect();
        }
        Some(ruleset) => {
            let ruleset = ruleset.clone();
            let (tx, mut rx) =
                mpsc::channel::<(Phase1Item, RuleOutcome)>(PHASE_CHANNEL_CAPACITY);
            let phase2 = tokio::spawn(async move {
                for item in passed_phase1 {
                    let outcome = apply_rules(&ruleset, &item.record);
                    if tx.send((item, outcome)).await.is_err() {
                        break;
                    }
                }
            });

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some((item, outcome))) => {
                        for warning in &outcome.warnings {
                            out.warnings.push((item.unit_id.clone(), warning.clone()));
                        }
                        if outcome.passed() {
                            out.validated.push(item.record);
                        } else {
                            out.failures.push(FailureRecord {
                                unit_id: item.unit_id,
                                failure_stage: FailureStage::Validation,
                                stage_input: Value::Object(item.stage_input),
                                raw_response: item.raw_response,
                                errors: outcome.errors,
                                retry_count,
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        phase2.abort();
                        break;
                    }
                }
            }
            let _ = phase2.await;
        }
    }

    // A unit the budget ran out on still lands in failures — the budget
    // must never cause silent attrition.
    let accounted: std::collections::BTreeSet<String> = out
        .validated
        .iter()
        .filter_map(|r| r.get("unit_id").and_then(|v| v.as_str()).map(String::from))
        .chain(out.failures.iter().map(|f| f.unit_id.clone()))
        .collect();
    for (unit_id, stage_input) in all_inputs {
        if !accounted.contains(&unit_id) {
            out.failures.push(internal_failure(
                &unit_id,
                &stage_input,
                String::new(),
                "validation budget exhausted before this unit was processed".to_string(),
                retry_count,
            ));
        }
    }

    Ok(out)
}

fn internal_failure(
    unit_id: &str,
    stage_input: &Map<String, Value>,
    raw_response: String,
    message: String,
    retry_count: u32,
) -> FailureRecord {
    FailureRecord {
        unit_id: unit_id.to_string(),
        failure_stage: FailureStage::PipelineInternal,
        stage_input: Value::Object(stage_input.clone()),
        raw_response,
        errors: vec![FailureError {
            path: String::new(),
            rule: "pipeline".to_string(),
            message,
        }],
        retry_count,
    }
}

/// Fence-strip, trailing-comma-clean, parse, and unwrap a raw response into
/// a JSON object. The raw text is never modified in place — the caller keeps
/// it for `raw_response`.
fn parse_response(raw: &str) -> Result<Map<String, Value>, String> {
    let stripped = strip_markdown_fences(raw);
    let cleaned = strip_trailing_commas(stripped);
    let value: Value = serde_json::from_str(cleaned.trim())
        .map_err(|e| format!("response is not valid JSON: {e}"))?;

    let object = match value {
        Value::Object(map) => map,
        other => return Err(format!("response is not a JSON object: {other}")),
    };

    // One-level unwrap of a double-encoded payload nested in `response`.
    if object.len() == 1 {
        if let Some(inner) = object.get("response") {
            match inner {
                Value::Object(map) => return Ok(map.clone()),
                Value::String(s) => {
                    if let Ok(Value::Object(map)) =
                        serde_json::from_str::<Value>(&strip_trailing_commas(s))
                    {
                        return Ok(map);
                    }
                }
                _ => {}
            }
        }
    }
    Ok(object)
}

/// `{**stage_input, **parsed_response}` with `unit_id` and `_metadata`
/// injected.
fn merge_record(
    unit_id: &str,
    stage_input: &Map<String, Value>,
    parsed: Map<String, Value>,
) -> Map<String, Value> {
    let mut record = stage_input.clone();
    for (key, value) in parsed {
        record.insert(key, value);
    }
    record.insert("unit_id".to_string(), Value::String(unit_id.to_string()));
    if !record.contains_key("_metadata") {
        record.insert("_metadata".to_string(), Value::Object(Map::new()));
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(unit_id: &str, content: &str) -> ResponseRecord {
        let mut stage_input = Map::new();
        stage_input.insert("unit_id".to_string(), json!(unit_id));
        stage_input.insert("topic".to_string(), json!("history"));
        ResponseRecord {
            unit_id: unit_id.to_string(),
            stage_input,
            content: Some(content.to_string()),
            error: None,
        }
    }

    fn schema() -> SchemaValidator {
        SchemaValidator::new(json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "score": {"type": "integer"},
            },
            "required": ["summary", "score"],
        }))
        .unwrap()
    }

    fn rules() -> RuleSet {
        serde_yaml::from_str(
            r#"
ranges:
  score: [0, 10]
"#,
        )
        .unwrap()
    }

    const BUDGET: Duration = Duration::from_secs(600);

    #[tokio::test]
    async fn valid_response_merges_and_passes() {
        let responses = vec![response("u1", r#"{"summary": "fine", "score": 7}"#)];
        let result = validate_stage(responses, Some(&schema()), Some(&rules()), BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.validated.len(), 1);
        assert!(result.failures.is_empty());
        let record = &result.validated[0];
        // Stage input fields carried forward, response merged over them.
        assert_eq!(record["topic"], json!("history"));
        assert_eq!(record["score"], json!(7));
        assert_eq!(record["unit_id"], json!("u1"));
        assert!(record.contains_key("_metadata"));
    }

    #[tokio::test]
    async fn fenced_response_is_sanitised_but_raw_preserved() {
        let raw = "```json\n{\"summary\": \"ok\", \"score\": \"bad\"}\n```";
        let responses = vec![response("u1", raw)];
        let result = validate_stage(responses, Some(&schema()), None, BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        let failure = &result.failures[0];
        assert_eq!(failure.failure_stage, FailureStage::SchemaValidation);
        // The untouched pre-strip text is what lands in raw_response.
        assert_eq!(failure.raw_response, raw);
    }

    #[tokio::test]
    async fn coercion_repairs_then_schema_passes() {
        let responses = vec![response("u1", r#"{"summary": "ok", "score": "7"}"#)];
        let result = validate_stage(responses, Some(&schema()), Some(&rules()), BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.validated.len(), 1);
        assert_eq!(result.validated[0]["score"], json!(7));
        assert_eq!(result.coercions.len(), 1);
        assert_eq!(result.coercions[0].1.action, "string->int");
    }

    #[tokio::test]
    async fn business_failure_is_validation_stage() {
        let responses = vec![response("u1", r#"{"summary": "ok", "score": 42}"#)];
        let result = validate_stage(responses, Some(&schema()), Some(&rules()), BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].failure_stage, FailureStage::Validation);
        assert_eq!(result.failures[0].errors[0].rule, "ranges");
    }

    #[tokio::test]
    async fn non_json_is_pipeline_internal() {
        let responses = vec![response("u1", "I cannot answer that.")];
        let result = validate_stage(responses, Some(&schema()), None, BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.failures.len(), 1);
        assert_eq!(
            result.failures[0].failure_stage,
            FailureStage::PipelineInternal
        );
        assert!(!result.failures[0].failure_stage.is_retryable());
    }

    #[tokio::test]
    async fn provider_error_is_pipeline_internal() {
        let mut r = response("u1", "");
        r.content = None;
        r.error = Some("upstream 500".to_string());
        let result = validate_stage(vec![r], Some(&schema()), None, BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(
            result.failures[0].failure_stage,
            FailureStage::PipelineInternal
        );
    }

    #[tokio::test]
    async fn double_encoded_response_unwraps() {
        let raw = r#"{"response": "{\"summary\": \"ok\", \"score\": 3}"}"#;
        let responses = vec![response("u1", raw)];
        let result = validate_stage(responses, Some(&schema()), None, BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.validated.len(), 1);
        assert_eq!(result.validated[0]["score"], json!(3));
    }

    #[tokio::test]
    async fn large_batches_do_not_deadlock() {
        // Regression guard for the bounded-channel contract: well past the
        // size where a naive parallel pipe stalls.
        let responses: Vec<ResponseRecord> = (0..200)
            .map(|i| {
                response(
                    &format!("u{i}"),
                    r#"{"summary": "ok", "score": 5}"#,
                )
            })
            .collect();
        let result = validate_stage(responses, Some(&schema()), Some(&rules()), BUDGET, 0)
            .await
            .unwrap();
        assert_eq!(result.validated.len(), 200);
        assert!(result.failures.is_empty());
    }

    #[tokio::test]
    async fn every_unit_lands_exactly_once() {
        let responses = vec![
            response("a", r#"{"summary": "ok", "score": 5}"#),
            response("b", "garbage"),
            response("c", r#"{"summary": "ok", "score": 99}"#),
        ];
        let result = validate_stage(responses, Some(&schema()), Some(&rules()), BUDGET, 1)
            .await
            .unwrap();
        assert_eq!(result.validated.len() + result.failures.len(), 3);
        assert!(result.failures.iter().all(|f| f.retry_count == 1));
    }
}
