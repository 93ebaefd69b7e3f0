//! Type coercion applied before strict schema validation.
//!
//! LLM output is schematically sloppy in predictable ways: numbers as
//! strings, booleans as "Yes", enums with stray prefixes, arrays serialized
//! as JSON text. Each converter is a small, individually tested step; every
//! applied coercion is traced so `[COERCE]` log lines can tell the operator
//! what was repaired.

use serde_json::{Map, Value};

/// One applied coercion, for tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionTrace {
    pub field: String,
    pub action: String,
}

/// Coerce `record`'s fields toward the types the schema declares.
/// Unknown fields and unfixable values are left untouched — strict schema
/// validation decides their fate.
pub fn coerce_record(record: &mut Map<String, Value>, schema: &Value) -> Vec<CoercionTrace> {
    let mut traces = Vec::new();
    let resolved = resolve_ref(schema, schema);
    let Some(properties) = resolved.get("properties").and_then(|p| p.as_object()) else {
        return traces;
    };

    for (field, subschema) in properties {
        let Some(value) = record.get(field) else {
            continue;
        };
        let subschema = resolve_ref(subschema, schema);
        if let Some((coerced, action)) = coerce_value(value, subschema, schema) {
            record.insert(field.clone(), coerced);
            traces.push(CoercionTrace {
                field: field.clone(),
                action,
            });
        }
    }
    traces
}

/// Resolve an internal `$ref` (`#/$defs/...` or `#/definitions/...`) one
/// level; nested refs resolve as they are encountered.
fn resolve_ref<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    let Some(reference) = schema.get("$ref").and_then(|r| r.as_str()) else {
        return schema;
    };
    let Some(pointer) = reference.strip_prefix('#') else {
        return schema;
    };
    root.pointer(pointer).unwrap_or(schema)
}

fn declared_types(subschema: &Value) -> Vec<&str> {
    match subschema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(ts)) => ts.iter().filter_map(|t| t.as_str()).collect(),
        _ => Vec::new(),
    }
}

fn coerce_value(value: &Value, subschema: &Value, root: &Value) -> Option<(Value, String)> {
    // Enum normalisation runs first: an enum field's type is usually
    // "string" and the raw value is usually a near-miss string.
    if let Some(allowed) = subschema.get("enum").and_then(|e| e.as_array()) {
        if let Some(result) = normalize_enum(value, allowed) {
            return Some(result);
        }
    }

    let types = declared_types(subschema);
    for target in &types {
        // Already conformant: nothing to do.
        if matches_type(value, target) {
            return None;
        }
    }

    for target in types {
        let coerced = match target {
            "integer" => to_integer(value),
            "number" => to_number(value),
            "boolean" => to_boolean(value),
            "string" => to_string_value(value),
            "array" => to_array(value, subschema, root),
            _ => None,
        };
        if let Some((v, action)) = coerced {
            return Some((v, action));
        }
    }
    None
}

fn matches_type(value: &Value, target: &str) -> bool {
    match target {
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn to_integer(value: &Value) -> Option<(Value, String)> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Some((Value::from(i), "string->int".to_string()));
            }
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.fract() == 0.0 {
                    return Some((Value::from(f as i64), "string->int".to_string()));
                }
            }
            None
        }
        Value::Number(n) => {
            let f = n.as_f64()?;
            if f.fract() == 0.0 {
                Some((Value::from(f as i64), "float->int".to_string()))
            } else {
                None
            }
        }
        _ => None,
    }
}

fn to_number(value: &Value) -> Option<(Value, String)> {
    match value {
        Value::String(s) => {
            let f = s.trim().parse::<f64>().ok()?;
            let n = serde_json::Number::from_f64(f)?;
            Some((Value::Number(n), "string->float".to_string()))
        }
        _ => None,
    }
}

fn to_boolean(value: &Value) -> Option<(Value, String)> {
    match value {
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some((Value::Bool(true), "string->bool".to_string())),
            "false" | "no" | "0" => Some((Value::Bool(false), "string->bool".to_string())),
            _ => None,
        },
        _ => None,
    }
}

fn to_string_value(value: &Value) -> Option<(Value, String)> {
    match value {
        Value::Number(n) => Some((Value::String(n.to_string()), "number->string".to_string())),
        Value::Bool(b) => Some((Value::String(b.to_string()), "bool->string".to_string())),
        _ => None,
    }
}

fn to_array(value: &Value, subschema: &Value, root: &Value) -> Option<(Value, String)> {
    match value {
        Value::String(s) => {
            // A JSON array serialized into a string parses straight back.
            let cleaned = strip_trailing_commas(s);
            if let Ok(parsed @ Value::Array(_)) = serde_json::from_str::<Value>(&cleaned) {
                return Some((parsed, "string->array(json)".to_string()));
            }
            // Otherwise wrap the single value, coercing it toward the item
            // schema when one is declared.
            let item_schema = subschema
                .get("items")
                .map(|s| resolve_ref(s, root));
            let wrapped = match item_schema {
                Some(items) => {
                    let inner = Value::String(s.clone());
                    match coerce_value(&inner, items, root) {
                        Some((coerced, _)) => coerced,
                        None => inner,
                    }
                }
                None => Value::String(s.clone()),
            };
            Some((Value::Array(vec![wrapped]), "wrap->array".to_string()))
        }
        _ => None,
    }
}

/// Case-insensitive enum match, with prefix stripping and `" | "` splitting
/// for multi-option responses.
fn normalize_enum(value: &Value, allowed: &[Value]) -> Option<(Value, String)> {
    let raw = value.as_str()?;
    if allowed.iter().any(|a| a == value) {
        return None;
    }

    let mut candidates: Vec<String> = Vec::new();
    let trimmed = raw.trim();
    candidates.push(trimmed.to_string());
    // "option_a | option_b" — the model hedged; try each part in order.
    for part in trimmed.split(" | ") {
        candidates.push(part.trim().to_string());
    }
    // "Category: value" / "CATEGORY_value" style prefixes.
    for candidate in candidates.clone() {
        if let Some((_, rest)) = candidate.split_once(':') {
            candidates.push(rest.trim().to_string());
        }
        if let Some((_, rest)) = candidate.split_once('_') {
            candidates.push(rest.trim().to_string());
        }
    }

    for candidate in &candidates {
        for member in allowed {
            let Some(member_str) = member.as_str() else {
                continue;
            };
            if member_str.eq_ignore_ascii_case(candidate) {
                return Some((
                    Value::String(member_str.to_string()),
                    format!("enum-normalize('{raw}')"),
                ));
            }
        }
    }
    None
}

/// Remove trailing commas before `}` or `]` in raw JSON text, outside
/// strings.
pub fn strip_trailing_commas(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = raw.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                let next_meaningful = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
