//! Anthropic adapter: Messages API realtime, Message Batches for batch.
//!
//! Batches are submitted inline — `upload_batch_file` is a no-op that hands
//! the local path forward, and `create_batch` posts the requests in one
//! call. The batch end state is generic ("ended"); success vs failure is
//! disambiguated by counting per-request outcomes.

use super::{
    BATCH_TRANSFER_TIMEOUT, BatchInfo, BatchResultItem, BatchResultMeta, BatchStatus, Provider,
    ProviderPricing, RealtimeResponse, read_json_response,
};
use crate::errors::ProviderError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;

const API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";
const MAX_TOKENS: u64 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    pricing: ProviderPricing,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        model: String,
        pricing: ProviderPricing,
    ) -> Self {
        Self {
            client,
            api_key,
            model,
            pricing,
            base_url: API_BASE.to_string(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn message_params(&self, prompt: &str, schema: Option<&Value>) -> Value {
        // The Messages API has no schema parameter; the schema rides in the
        // prompt and validation enforces it downstream.
        let content = match schema {
            Some(schema) => format!(
                "{prompt}\n\nRespond with JSON matching this schema:\n{schema}"
            ),
            None => prompt.to_string(),
        };
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": content}],
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<RealtimeResponse, ProviderError> {
        let response = self
            .request(self.client.post(format!("{}/messages", self.base_url)))
            .json(&self.message_params(prompt, schema))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let body = read_json_response(PROVIDER, response).await?;

        let content = body["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing content[0].text".to_string(),
            })?
            .to_string();
        Ok(RealtimeResponse {
            content,
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            finish_reason: body["stop_reason"].as_str().map(String::from),
        })
    }

    fn format_batch_request(&self, unit_id: &str, prompt: &str, schema: Option<&Value>) -> Value {
        json!({
            "custom_id": unit_id,
            "params": self.message_params(prompt, schema),
        })
    }

    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        // Inline batches: defer to create_batch with the local path.
        Ok(path.display().to_string())
    }

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError> {
        let content = std::fs::read_to_string(file_id).map_err(|e| ProviderError::Transient {
            provider: PROVIDER.to_string(),
            message: format!("cannot read batch file {file_id}: {e}"),
        })?;
        let requests: Vec<Value> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .map_err(|e| ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: format!("bad batch request line: {e}"),
            })?;

        let response = self
            .request(
                self.client
                    .post(format!("{}/messages/batches", self.base_url)),
            )
            .json(&json!({"requests": requests}))
            .timeout(BATCH_TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let body = read_json_response(PROVIDER, response).await?;
        body["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "batch creation returned no id".to_string(),
            })
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchInfo, ProviderError> {
        let response = self
            .request(
                self.client
                    .get(format!("{}/messages/batches/{batch_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        if response.status().as_u16() == 404 {
            return Err(ProviderError::BatchNotFound {
                provider: PROVIDER.to_string(),
                batch_id: batch_id.to_string(),
            });
        }
        let body = read_json_response(PROVIDER, response).await?;

        let native = body["processing_status"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();
        let counts = &body["request_counts"];
        let succeeded = counts["succeeded"].as_u64().unwrap_or(0);
        let errored = counts["errored"].as_u64().unwrap_or(0);
        let processing = counts["processing"].as_u64().unwrap_or(0);
        let total = succeeded + errored + processing
            + counts["canceled"].as_u64().unwrap_or(0)
            + counts["expired"].as_u64().unwrap_or(0);

        // "ended" is generic: every request errored means the batch failed.
        let status = match native.as_str() {
            "in_progress" => BatchStatus::Running,
            "canceling" => BatchStatus::Cancelled,
            "ended" => {
                if succeeded == 0 && errored > 0 {
                    BatchStatus::Failed
                } else {
                    BatchStatus::Completed
                }
            }
            _ => BatchStatus::Pending,
        };
        let progress = if total > 0 {
            Some((total - processing) as f64 / total as f64)
        } else {
            None
        };
        Ok(BatchInfo {
            status,
            provider_status: native,
            progress,
            error: None,
        })
    }

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResultItem>, BatchResultMeta), ProviderError> {
        let response = self
            .request(
                self.client
                    .get(format!("{}/messages/batches/{batch_id}", self.base_url)),
            )
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let batch = read_json_response(PROVIDER, response).await?;
        let results_url = batch["results_url"].as_str().ok_or_else(|| {
            ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: format!("batch {batch_id} has no results_url"),
            }
        })?;

        let response = self
            .request(self.client.get(results_url))
            .timeout(BATCH_TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(PROVIDER, status.as_u16(), &text));
        }

        let mut items = Vec::new();
        let mut meta = BatchResultMeta::default();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let row: Value =
                serde_json::from_str(line).map_err(|e| ProviderError::MalformedResponse {
                    provider: PROVIDER.to_string(),
                    message: format!("bad result line: {e}"),
                })?;
            let unit_id = row["custom_id"].as_str().unwrap_or_default().to_string();
            let result = &row["result"];
            let (content, error, input_tokens, output_tokens) =
                match result["type"].as_str().unwrap_or("errored") {
                    "succeeded" => {
                        let message = &result["message"];
                        (
                            message["content"][0]["text"].as_str().map(String::from),
                            None,
                            message["usage"]["input_tokens"].as_u64().unwrap_or(0),
                            message["usage"]["output_tokens"].as_u64().unwrap_or(0),
                        )
                    }
                    other => (
                        None,
                        Some(format!(
                            "{other}: {}",
                            result["error"]["message"].as_str().unwrap_or("no detail")
                        )),
                        0,
                        0,
                    ),
                };
            meta.input_tokens += input_tokens;
            meta.output_tokens += output_tokens;
            items.push(BatchResultItem {
                unit_id,
                content,
                error,
                input_tokens,
                output_tokens,
            });
        }
        Ok((items, meta))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError> {
        let response = self
            .request(self.client.post(format!(
                "{}/messages/batches/{batch_id}/cancel",
                self.base_url
            )))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        Ok(response.status().is_success())
    }

    fn pricing(&self) -> ProviderPricing {
        self.pricing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new(
            reqwest::Client::new(),
            "k".to_string(),
            "claude-3-5-haiku-20241022".to_string(),
            ProviderPricing {
                model: crate::registry::ModelPricing {
                    input: 0.4,
                    output: 2.0,
                    batch: true,
                },
                realtime_multiplier: 2.0,
            },
        )
    }

    #[test]
    fn batch_request_is_inline_params() {
        let line = provider().format_batch_request("unit_3", "Hi", None);
        assert_eq!(line["custom_id"], "unit_3");
        assert_eq!(line["params"]["model"], "claude-3-5-haiku-20241022");
        assert_eq!(line["params"]["messages"][0]["content"], "Hi");
    }

    #[test]
    fn schema_rides_in_the_prompt() {
        let schema = json!({"type": "object"});
        let line = provider().format_batch_request("u", "Describe Ada", Some(&schema));
        let content = line["params"]["messages"][0]["content"].as_str().unwrap();
        assert!(content.contains("Describe Ada"));
        assert!(content.contains("\"type\":\"object\""));
    }

    #[tokio::test]
    async fn upload_is_a_no_op_returning_the_path() {
        let id = provider()
            .upload_batch_file(Path::new("/tmp/batch.jsonl"))
            .await
            .unwrap();
        assert_eq!(id, "/tmp/batch.jsonl");
    }
}
