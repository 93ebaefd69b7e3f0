//! Uniform interface over the LLM providers.
//!
//! Each provider implements the full capability set — realtime generation
//! plus the batch lifecycle (upload, create, poll, collect, cancel) — behind
//! one trait, so the orchestrator never sees a wire dialect. Native batch
//! statuses normalise to a five-state enum.
//!
//! Every HTTP call carries an explicit client-level timeout. An unbounded
//! hang at 0% CPU is a known failure mode; no client may inherit a default
//! "no timeout" policy.

mod anthropic;
mod gemini;
mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

use crate::errors::ProviderError;
use crate::registry::{ModelPricing, ModelRegistry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Per-request ceiling for ordinary calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Batch submissions and result downloads move more bytes.
pub const BATCH_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

/// Normalised batch status across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Snapshot of a provider-side batch.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub status: BatchStatus,
    /// The provider's native status string, persisted for operators.
    pub provider_status: String,
    /// Completed-request fraction when the provider reports one.
    pub progress: Option<f64>,
    pub error: Option<String>,
}

/// One unit's result out of a downloaded batch.
#[derive(Debug, Clone)]
pub struct BatchResultItem {
    pub unit_id: String,
    pub content: Option<String>,
    pub error: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Batch-level metadata returned with results.
#[derive(Debug, Clone, Default)]
pub struct BatchResultMeta {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A realtime completion.
#[derive(Debug, Clone)]
pub struct RealtimeResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: Option<String>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;
    fn model(&self) -> &str;

    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<RealtimeResponse, ProviderError>;

    /// Provider-specific line for the newline-delimited batch request file.
    fn format_batch_request(&self, unit_id: &str, prompt: &str, schema: Option<&Value>) -> Value;

    /// Upload the batch file; returns a file id. Providers that accept
    /// inline batches return the path itself and defer to `create_batch`.
    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError>;

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError>;

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchInfo, ProviderError>;

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResultItem>, BatchResultMeta), ProviderError>;

    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError>;

    fn pricing(&self) -> ProviderPricing;

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, is_batch: bool) -> f64 {
        let pricing = self.pricing();
        let base = (input_tokens as f64 / 1e6) * pricing.model.input
            + (output_tokens as f64 / 1e6) * pricing.model.output;
        if is_batch {
            base
        } else {
            base * pricing.realtime_multiplier
        }
    }
}

/// Pricing snapshot a provider carries from the registry.
#[derive(Debug, Clone, Copy)]
pub struct ProviderPricing {
    pub model: ModelPricing,
    pub realtime_multiplier: f64,
}

/// Resolve the API key for a provider from the registry's conventional
/// environment variable.
pub fn api_key_for(registry: &ModelRegistry, provider: &str) -> Result<String> {
    let entry = registry
        .provider(provider)
        .with_context(|| format!("Unknown provider '{provider}'"))?;
    std::env::var(&entry.env_var)
        .with_context(|| format!("{} is not set (required by provider '{provider}')", entry.env_var))
}

/// Is the provider's credential present in the environment?
pub fn has_credentials(registry: &ModelRegistry, provider: &str) -> bool {
    registry
        .provider(provider)
        .map(|entry| std::env::var(&entry.env_var).is_ok())
        .unwrap_or(false)
}

/// Construct a provider client by name, resolving model and credentials
/// through the registry.
pub fn create_provider(
    registry: &ModelRegistry,
    provider: &str,
    model: Option<&str>,
) -> Result<Box<dyn Provider>> {
    let entry = registry
        .provider(provider)
        .with_context(|| format!("Unknown provider '{provider}'"))?;
    let model = model.unwrap_or(&entry.default_model).to_string();
    let api_key = api_key_for(registry, provider)?;
    let pricing = ProviderPricing {
        model: registry.pricing(provider, &model).unwrap_or(ModelPricing {
            input: 0.0,
            output: 0.0,
            batch: true,
        }),
        realtime_multiplier: entry.realtime_multiplier,
    };

    let client = http_client()?;
    Ok(match provider {
        "openai" => Box::new(OpenAiProvider::new(client, api_key, model, pricing)),
        "anthropic" => Box::new(AnthropicProvider::new(client, api_key, model, pricing)),
        "gemini" => Box::new(GeminiProvider::new(client, api_key, model, pricing)),
        other => anyhow::bail!("No adapter for provider '{other}'"),
    })
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .context("Failed to build HTTP client")
}

/// Shared response handling: classify non-2xx statuses through the error
/// taxonomy, parse 2xx bodies as JSON.
pub(crate) async fn read_json_response(
    provider: &str,
    response: reqwest::Response,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| ProviderError::from_transport(provider, &e))?;
    if !status.is_success() {
        return Err(ProviderError::from_status(provider, status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::MalformedResponse {
        provider: provider.to_string(),
        message: format!("bad JSON body: {e}"),
    })
}

#[cfg(test)]
pub mod mock {
    //! In-process fake provider for orchestrator tests.

    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider: pops one canned outcome per realtime call.
    pub struct MockProvider {
        pub model: String,
        pub responses: Mutex<Vec<Result<RealtimeResponse, ProviderError>>>,
        pub calls: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(responses: Vec<Result<RealtimeResponse, ProviderError>>) -> Self {
            Self {
                model: "mock-model".to_string(),
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn ok(content: &str) -> Result<RealtimeResponse, ProviderError> {
            Ok(RealtimeResponse {
                content: content.to_string(),
                input_tokens: 10,
                output_tokens: 20,
                finish_reason: Some("stop".to_string()),
            })
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn model(&self) -> &str {
            &self.model
        }

        async fn generate_realtime(
            &self,
            _prompt: &str,
            _schema: Option<&Value>,
        ) -> Result<RealtimeResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(ProviderError::Transient {
                    provider: "mock".to_string(),
                    message: "script exhausted".to_string(),
                });
            }
            responses.remove(0)
        }

        fn format_batch_request(
            &self,
            unit_id: &str,
            prompt: &str,
            _schema: Option<&Value>,
        ) -> Value {
            serde_json::json!({"custom_id": unit_id, "prompt": prompt})
        }

        async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
            Ok(path.display().to_string())
        }

        async fn create_batch(&self, _file_id: &str) -> Result<String, ProviderError> {
            Ok("mock-batch-1".to_string())
        }

        async fn get_batch_status(&self, _batch_id: &str) -> Result<BatchInfo, ProviderError> {
            Ok(BatchInfo {
                status: BatchStatus::Completed,
                provider_status: "completed".to_string(),
                progress: Some(1.0),
                error: None,
            })
        }

        async fn download_batch_results(
            &self,
            _batch_id: &str,
        ) -> Result<(Vec<BatchResultItem>, BatchResultMeta), ProviderError> {
            Ok((Vec::new(), BatchResultMeta::default()))
        }

        async fn cancel_batch(&self, _batch_id: &str) -> Result<bool, ProviderError> {
            Ok(true)
        }

        fn pricing(&self) -> ProviderPricing {
            ProviderPricing {
                model: ModelPricing {
                    input: 1.0,
                    output: 2.0,
                    batch: true,
                },
                realtime_multiplier: 2.0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_terminality() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
    }

    #[test]
    fn cost_estimation_applies_realtime_multiplier() {
        let mock = mock::MockProvider::new(Vec::new());
        let batch = mock.estimate_cost(1_000_000, 1_000_000, true);
        let realtime = mock.estimate_cost(1_000_000, 1_000_000, false);
        assert!((batch - 3.0).abs() < 1e-9);
        assert!((realtime - 6.0).abs() < 1e-9);
    }

    #[test]
    fn missing_credential_is_reported_with_env_var_name() {
        let registry = ModelRegistry::builtin();
        // Pick a variable name that cannot exist in the test environment.
        unsafe { std::env::remove_var("OPENAI_API_KEY") };
        let err = api_key_for(&registry, "openai").unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
