//! Model registry: provider metadata and pricing.
//!
//! Loaded once at startup and passed down as an immutable value. Prices are
//! stored at the already-discounted batch rate, per million tokens; realtime
//! cost multiplies by the per-provider `realtime_multiplier`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const BUILTIN_REGISTRY: &str = include_str!("builtin_models.yaml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    pub providers: BTreeMap<String, ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Conventional API-key environment variable for this provider.
    pub env_var: String,
    pub default_model: String,
    /// Realtime price is batch price times this factor.
    #[serde(default = "default_realtime_multiplier")]
    pub realtime_multiplier: f64,
    #[serde(default)]
    pub models: BTreeMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    /// USD per 1M input tokens, batch rate.
    pub input: f64,
    /// USD per 1M output tokens, batch rate.
    pub output: f64,
    /// Whether the provider supports batch submission for this model.
    #[serde(default = "default_true")]
    pub batch: bool,
}

fn default_realtime_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl ModelRegistry {
    /// The compiled-in registry shipped with the binary.
    pub fn builtin() -> Self {
        serde_yaml::from_str(BUILTIN_REGISTRY).expect("builtin model registry must parse")
    }

    /// Load from a YAML file, e.g. a registry snapshotted into a run.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model registry at {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse model registry at {}", path.display()))
    }

    /// Load the registry snapshotted into a run's config directory, falling
    /// back to the builtin when the snapshot is absent.
    pub fn load_for_run(run_dir: &Path) -> Self {
        let snapshot = run_dir.join("config").join("models.yaml");
        if snapshot.exists() {
            match Self::load(&snapshot) {
                Ok(r) => return r,
                Err(e) => tracing::warn!("ignoring unreadable registry snapshot: {e:#}"),
            }
        }
        Self::builtin()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.get(name)
    }

    /// Pricing lookup. `None` when the provider or model is unknown; callers
    /// fall back to zero cost with a warning.
    pub fn pricing(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        self.providers.get(provider)?.models.get(model).copied()
    }

    /// Best-effort cost in USD for a token count against a provider/model.
    /// Unknown models price at zero.
    pub fn estimate_cost(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        is_batch: bool,
    ) -> f64 {
        let Some(entry) = self.providers.get(provider) else {
            return 0.0;
        };
        let Some(pricing) = entry.models.get(model) else {
            tracing::warn!("no pricing for {provider}/{model}, costing at zero");
            return 0.0;
        };
        let base = (input_tokens as f64 / 1e6) * pricing.input
            + (output_tokens as f64 / 1e6) * pricing.output;
        if is_batch {
            base
        } else {
            base * entry.realtime_multiplier
        }
    }
}
