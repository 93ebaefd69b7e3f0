//! Unit generation: items → units → chunks.
//!
//! Three strategies produce units from the items source:
//! - `direct` — one unit per item
//! - `permutation` — every ordered arrangement of the item list across the
//!   declared positions
//! - `cross_product` — cartesian product, one source list per position
//!
//! Optional Monte-Carlo repetition expands each base unit into N repetitions
//! with deterministic per-repetition seeds. Generation is a pure function of
//! the config and items: same inputs, same units.

use crate::config::{PipelineConfig, ProcessingConfig, Strategy};
use crate::expr::{CompiledBlock, EvalContext, StageRng, derive_seed};
use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// One pipeline input record. Always carries `unit_id`.
pub type Unit = Map<String, Value>;

/// Ceiling on generated units; a permutation typo must not fill the disk.
const MAX_UNITS: usize = 1_000_000;

/// Load the item list from the configured source file (YAML or JSON).
pub fn load_items(config_dir: &Path, processing: &ProcessingConfig) -> Result<Value> {
    let path = config_dir.join(&processing.items.source);
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read items file at {}", path.display()))?;
    let data: Value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse items file at {}", path.display()))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse items file at {}", path.display()))?
    };
    Ok(data)
}

/// Generate all units for a run.
pub fn generate(config: &PipelineConfig, items_data: &Value) -> Result<Vec<Unit>> {
    let processing = &config.processing;
    let base_units = match processing.strategy {
        Strategy::Direct => direct_units(processing, items_data)?,
        Strategy::Permutation => permutation_units(processing, items_data)?,
        Strategy::CrossProduct => cross_product_units(processing, items_data)?,
    };

    let mut units = base_units;
    if !processing.expressions.is_empty() {
        units = apply_generation_expressions(processing, units)?;
    }
    if let Some(repeat) = processing.repeat {
        units = repeat_units(units, repeat)?;
    }
    Ok(units)
}

/// Partition units into chunks of `chunk_size`. Never emits an empty chunk.
pub fn chunk_units(units: Vec<Unit>, chunk_size: usize) -> Vec<Vec<Unit>> {
    if chunk_size == 0 {
        return if units.is_empty() {
            Vec::new()
        } else {
            vec![units]
        };
    }
    units
        .chunks(chunk_size)
        .filter(|c| !c.is_empty())
        .map(|c| c.to_vec())
        .collect()
}

fn item_list<'a>(data: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    data.get(key)
        .and_then(|v| v.as_array())
        .with_context(|| format!("Items source has no list under key '{key}'"))
}

fn item_name(item: &Value, name_field: &str) -> Result<String> {
    let raw = match item {
        Value::Object(map) => map
            .get(name_field)
            .with_context(|| format!("Item missing name field '{name_field}': {item}"))?,
        other => other,
    };
    let text = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(sanitize_id(&text))
}

/// Lowercase, non-alphanumerics collapsed to single underscores.
fn sanitize_id(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_underscore = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    out.trim_end_matches('_').to_string()
}

fn item_fields(item: &Value) -> Map<String, Value> {
    match item {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

fn direct_units(processing: &ProcessingConfig, data: &Value) -> Result<Vec<Unit>> {
    let items = item_list(data, &processing.items.key)?;
    let mut units = Vec::with_capacity(items.len());
    for item in items {
        let mut unit = item_fields(item);
        unit.insert(
            "unit_id".to_string(),
            Value::String(item_name(item, &processing.items.name_field)?),
        );
        units.push(unit);
    }
    dedupe_check(&units)?;
    Ok(units)
}

fn permutation_units(processing: &ProcessingConfig, data: &Value) -> Result<Vec<Unit>> {
    let items = item_list(data, &processing.items.key)?;
    let k = processing.positions.len();
    if k == 0 {
        bail!("permutation strategy requires at least one position");
    }
    if k > items.len() {
        bail!(
            "permutation strategy needs {k} positions but only {} items",
            items.len()
        );
    }

    let mut units = Vec::new();
    let mut indices: Vec<usize> = Vec::with_capacity(k);
    let mut used = vec![false; items.len()];
    permute(
        items,
        processing,
        &mut indices,
        &mut used,
        &mut units,
    )?;
    Ok(units)
}

fn permute(
    items: &[Value],
    processing: &ProcessingConfig,
    indices: &mut Vec<usize>,
    used: &mut [bool],
    out: &mut Vec<Unit>,
) -> Result<()> {
    if indices.len() == processing.positions.len() {
        let selection: Vec<&Value> = indices.iter().map(|&i| &items[i]).collect();
        out.push(build_positional_unit(processing, &selection)?);
        if out.len() > MAX_UNITS {
            bail!("unit generation exceeded {MAX_UNITS} units");
        }
        return Ok(());
    }
    for i in 0..items.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        indices.push(i);
        permute(items, processing, indices, used, out)?;
        indices.pop();
        used[i] = false;
    }
    Ok(())
}

fn cross_product_units(processing: &ProcessingConfig, data: &Value) -> Result<Vec<Unit>> {
    if processing.positions.is_empty() {
        bail!("cross_product strategy requires at least one position");
    }
    let lists: Vec<&Vec<Value>> = processing
        .positions
        .iter()
        .map(|p| {
            let key = p.source_key.as_deref().unwrap_or(&processing.items.key);
            item_list(data, key)
        })
        .collect::<Result<_>>()?;

    let total: usize = lists.iter().map(|l| l.len()).product();
    if total > MAX_UNITS {
        bail!("unit generation exceeded {MAX_UNITS} units");
    }

    let mut units = Vec::with_capacity(total);
    let mut cursor = vec![0usize; lists.len()];
    if lists.iter().any(|l| l.is_empty()) {
        return Ok(units);
    }
    loop {
        let selection: Vec<&Value> = cursor
            .iter()
            .zip(lists.iter())
            .map(|(&i, list)| &list[i])
            .collect();
        units.push(build_positional_unit(processing, &selection)?);

        let mut pos = lists.len();
        loop {
            if pos == 0 {
                return Ok(units);
            }
            pos -= 1;
            cursor[pos] += 1;
            if cursor[pos] < lists[pos].len() {
                break;
            }
            cursor[pos] = 0;
        }
    }
}

fn build_positional_unit(processing: &ProcessingConfig, selection: &[&Value]) -> Result<Unit> {
    let mut unit = Map::new();
    let mut id_parts = Vec::with_capacity(selection.len());
    for (position, item) in processing.positions.iter().zip(selection) {
        unit.insert(position.name.clone(), (*item).clone());
        id_parts.push(item_name(item, &processing.items.name_field)?);
    }
    unit.insert(
        "unit_id".to_string(),
        Value::String(id_parts.join("__")),
    );
    Ok(unit)
}

fn dedupe_check(units: &[Unit]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for unit in units {
        let id = unit.get("unit_id").and_then(|v| v.as_str()).unwrap_or("");
        if !seen.insert(id.to_string()) {
            bail!("duplicate unit_id '{id}' generated; item names must be unique");
        }
    }
    Ok(())
}

/// Evaluate the processing-level expression block against each unit, with a
/// per-unit deterministic RNG.
fn apply_generation_expressions(
    processing: &ProcessingConfig,
    units: Vec<Unit>,
) -> Result<Vec<Unit>> {
    let block =
        CompiledBlock::compile(&processing.expressions).context("Bad processing expression")?;
    let mut out = Vec::with_capacity(units.len());
    for unit in units {
        let unit_id = unit
            .get("unit_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut rng = StageRng::from_seed(derive_seed(&unit_id, "_generation"));
        let mut vars: HashMap<String, Value> =
            unit.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let mut ctx = EvalContext::new(&mut vars, Some(&mut rng));
        block
            .run(&mut ctx)
            .with_context(|| format!("Processing expression failed for unit '{unit_id}'"))?;
        let mut merged = unit;
        for key in block.keys() {
            if let Some(value) = vars.get(key) {
                merged.insert(key.to_string(), value.clone());
            }
        }
        out.push(merged);
    }
    Ok(out)
}

/// Expand each base unit into `repeat` Monte-Carlo repetitions.
fn repeat_units(units: Vec<Unit>, repeat: u32) -> Result<Vec<Unit>> {
    if repeat == 0 {
        bail!("repeat must be at least 1");
    }
    if units.len().saturating_mul(repeat as usize) > MAX_UNITS {
        bail!("unit generation exceeded {MAX_UNITS} units");
    }
    let mut out = Vec::with_capacity(units.len() * repeat as usize);
    for unit in &units {
        let base_id = unit
            .get("unit_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        for rep in 0..repeat {
            let mut clone = unit.clone();
            clone.insert(
                "unit_id".to_string(),
                Value::String(format!("{base_id}__rep{rep:04}")),
            );
            clone.insert("_repetition_id".to_string(), Value::from(rep));
            clone.insert(
                "_repetition_seed".to_string(),
                Value::from(derive_seed(&base_id, &format!("rep{rep:04}"))),
            );
            out.push(clone);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ItemsConfig, PositionConfig, ValidationRetryConfig};
    use indexmap::IndexMap;
    use serde_json::json;

    fn processing(strategy: Strategy) -> ProcessingConfig {
        ProcessingConfig {
            strategy,
            chunk_size: 50,
            repeat: None,
            expressions: IndexMap::new(),
            positions: Vec::new(),
            items: ItemsConfig {
                source: "items.yaml".into(),
                key: "people".to_string(),
                name_field: "name".to_string(),
            },
            validation_retry: ValidationRetryConfig::default(),
        }
    }

    fn people() -> Value {
        json!({
            "people": [
                {"name": "Ada Lovelace", "role": "mathematician"},
                {"name": "Grace Hopper", "role": "admiral"},
                {"name": "Alan Turing", "role": "logician"},
            ]
        })
    }

    #[test]
    fn direct_strategy_one_unit_per_item() {
        let p = processing(Strategy::Direct);
        let units = direct_units(&p, &people()).unwrap();
        assert_eq!(units.len(), 3);
        assert_eq!(units[0]["unit_id"], json!("ada_lovelace"));
        assert_eq!(units[0]["role"], json!("mathematician"));
    }

    #[test]
    fn permutation_strategy_counts_arrangements() {
        let mut p = processing(Strategy::Permutation);
        p.positions = vec![
            PositionConfig {
                name: "speaker".to_string(),
                source_key: None,
            },
            PositionConfig {
                name: "listener".to_string(),
                source_key: None,
            },
        ];
        let units = permutation_units(&p, &people()).unwrap();
        // 3P2 = 6 ordered pairs, no self-pairing.
        assert_eq!(units.len(), 6);
        for unit in &units {
            assert_ne!(unit["speaker"]["name"], unit["listener"]["name"]);
        }
        assert_eq!(units[0]["unit_id"], json!("ada_lovelace__grace_hopper"));
    }

    #[test]
    fn cross_product_strategy_uses_source_keys() {
        let mut p = processing(Strategy::CrossProduct);
        p.positions = vec![
            PositionConfig {
                name: "person".to_string(),
                source_key: Some("people".to_string()),
            },
            PositionConfig {
                name: "topic".to_string(),
                source_key: Some("topics".to_string()),
            },
        ];
        let data = json!({
            "people": [{"name": "Ada"}, {"name": "Grace"}],
            "topics": [{"name": "computing"}, {"name": "history"}, {"name": "art"}],
        });
        let units = cross_product_units(&p, &data).unwrap();
        assert_eq!(units.len(), 6);
        assert_eq!(units[0]["unit_id"], json!("ada__computing"));
        assert_eq!(units[5]["unit_id"], json!("grace__art"));
    }

    #[test]
    fn generation_is_deterministic() {
        let mut config_p = processing(Strategy::Direct);
        config_p
            .expressions
            .insert("luck".to_string(), "random.randint(1, 100)".to_string());
        let config = crate::config::PipelineConfig {
            pipeline: crate::config::PipelineSection {
                name: "t".to_string(),
                steps: Vec::new(),
            },
            api: Default::default(),
            processing: config_p,
            prompts: Default::default(),
            schemas: Default::default(),
            validation: Default::default(),
            post_process: Vec::new(),
        };
        let a = generate(&config, &people()).unwrap();
        let b = generate(&config, &people()).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        // And the expression actually ran.
        assert!(a[0].contains_key("luck"));
    }

    #[test]
    fn repetition_expands_with_deterministic_seeds() {
        let units = direct_units(&processing(Strategy::Direct), &people()).unwrap();
        let repeated = repeat_units(units.clone(), 4).unwrap();
        assert_eq!(repeated.len(), 12);
        assert_eq!(repeated[0]["unit_id"], json!("ada_lovelace__rep0000"));
        assert_eq!(repeated[3]["unit_id"], json!("ada_lovelace__rep0003"));
        assert_eq!(repeated[0]["_repetition_id"], json!(0));

        // Seeds differ across repetitions but reproduce across calls.
        let again = repeat_units(units, 4).unwrap();
        assert_eq!(repeated[0]["_repetition_seed"], again[0]["_repetition_seed"]);
        assert_ne!(repeated[0]["_repetition_seed"], repeated[1]["_repetition_seed"]);
    }

    #[test]
    fn chunking_never_emits_empty_chunks() {
        let units = direct_units(&processing(Strategy::Direct), &people()).unwrap();
        let chunks = chunk_units(units, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[1].len(), 1);
        assert!(chunk_units(Vec::new(), 10).is_empty());
    }

    #[test]
    fn duplicate_unit_ids_are_rejected() {
        let p = processing(Strategy::Direct);
        let data = json!({"people": [{"name": "Ada"}, {"name": "Ada"}]});
        assert!(direct_units(&p, &data).is_err());
    }

    #[test]
    fn sanitize_id_normalizes() {
        assert_eq!(sanitize_id("Ada Lovelace"), "ada_lovelace");
        assert_eq!(sanitize_id("  O'Brien--Smith  "), "o_brien_smith");
    }
}
