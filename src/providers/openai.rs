//! OpenAI adapter: chat completions realtime, Files + Batches API for batch.

use super::{
    BATCH_TRANSFER_TIMEOUT, BatchInfo, BatchResultItem, BatchResultMeta, BatchStatus, Provider,
    ProviderPricing, RealtimeResponse, read_json_response,
};
use crate::errors::ProviderError;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;

const API_BASE: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "openai";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    pricing: ProviderPricing,
    base_url: String,
}

impl OpenAiProvider {
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

    fn chat_body(&self, prompt: &str, schema: Option<&Value>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema},
            });
        } else {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn normalise_status(native: &str) -> BatchStatus {
        match native {
            "validating" => BatchStatus::Pending,
            "in_progress" | "finalizing" => BatchStatus::Running,
            "completed" => BatchStatus::Completed,
            "failed" | "expired" => BatchStatus::Failed,
            "cancelling" | "cancelled" => BatchStatus::Cancelled,
            _ => BatchStatus::Running,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
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
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.chat_body(prompt, schema))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let body = read_json_response(PROVIDER, response).await?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();
        Ok(RealtimeResponse {
            content,
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            finish_reason: body["choices"][0]["finish_reason"]
                .as_str()
                .map(String::from),
        })
    }

    fn format_batch_request(&self, unit_id: &str, prompt: &str, schema: Option<&Value>) -> Value {
        json!({
            "custom_id": unit_id,
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": self.chat_body(prompt, schema),
        })
    }

    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        let bytes = std::fs::read(path).map_err(|e| ProviderError::Transient {
            provider: PROVIDER.to_string(),
            message: format!("cannot read batch file {}: {e}", path.display()),
        })?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("batch.jsonl")
            .to_string();
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
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
                message: "file upload returned no id".to_string(),
            })
    }

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/batches", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }))
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
            .client
            .get(format!("{}/batches/{batch_id}", self.base_url))
            .bearer_auth(&self.api_key)
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

        let native = body["status"].as_str().unwrap_or("unknown").to_string();
        let counts = &body["request_counts"];
        let progress = match (counts["completed"].as_f64(), counts["total"].as_f64()) {
            (Some(done), Some(total)) if total > 0.0 => Some(done / total),
            _ => None,
        };
        Ok(BatchInfo {
            status: Self::normalise_status(&native),
            provider_status: native,
            progress,
            error: body["errors"]["data"][0]["message"]
                .as_str()
                .map(String::from),
        })
    }

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResultItem>, BatchResultMeta), ProviderError> {
        let response = self
            .client
            .get(format!("{}/batches/{batch_id}", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(PROVIDER, &e))?;
        let batch = read_json_response(PROVIDER, response).await?;
        let output_file = batch["output_file_id"].as_str().ok_or_else(|| {
            ProviderError::MalformedResponse {
                provider: PROVIDER.to_string(),
                message: format!("batch {batch_id} has no output_file_id"),
            }
        })?;

        let response = self
            .client
            .get(format!("{}/files/{output_file}/content", self.base_url))
            .bearer_auth(&self.api_key)
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
            let response_body = &row["response"]["body"];
            let status_code = row["response"]["status_code"].as_u64().unwrap_or(0);

            let (content, error) = if !row["error"].is_null() {
                (None, Some(row["error"].to_string()))
            } else if status_code >= 400 {
                (None, Some(format!("request failed with status {status_code}")))
            } else {
                (
                    response_body["choices"][0]["message"]["content"]
                        .as_str()
                        .map(String::from),
                    None,
                )
            };
            let input_tokens = response_body["usage"]["prompt_tokens"].as_u64().unwrap_or(0);
            let output_tokens = response_body["usage"]["completion_tokens"]
                .as_u64()
                .unwrap_or(0);
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
            .client
            .post(format!("{}/batches/{batch_id}/cancel", self.base_url))
            .bearer_auth(&self.api_key)
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

    #[test]
    fn batch_request_carries_custom_id_and_body() {
        let provider = OpenAiProvider::new(
            reqwest::Client::new(),
            "k".to_string(),
            "gpt-4o-mini".to_string(),
            ProviderPricing {
                model: crate::registry::ModelPricing {
                    input: 0.075,
                    output: 0.3,
                    batch: true,
                },
                realtime_multiplier: 2.0,
            },
        );
        let line = provider.format_batch_request("unit_7", "Hello", None);
        assert_eq!(line["custom_id"], "unit_7");
        assert_eq!(line["url"], "/v1/chat/completions");
        assert_eq!(line["body"]["model"], "gpt-4o-mini");
        assert_eq!(line["body"]["messages"][0]["content"], "Hello");
    }

    #[test]
    fn status_normalisation_covers_native_states() {
        for (native, expected) in [
            ("validating", BatchStatus::Pending),
            ("in_progress", BatchStatus::Running),
            ("finalizing", BatchStatus::Running),
            ("completed", BatchStatus::Completed),
            ("failed", BatchStatus::Failed),
            ("expired", BatchStatus::Failed),
            ("cancelled", BatchStatus::Cancelled),
        ] {
            assert_eq!(OpenAiProvider::normalise_status(native), expected);
        }
    }
}
