//! Chat-completions client for OpenAI-compatible endpoints (Groq, OpenAI,
//! local servers).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{CompletionOptions, InferenceClient, InferenceError};
use crate::config::ApiKey;

/// Inference client speaking the `/chat/completions` protocol
pub struct OpenAiCompatClient {
    endpoint: String,
    model: String,
    api_key: ApiKey,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: ApiKey,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            client,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl InferenceClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compat"
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/chat/completions", self.endpoint);

        let mut messages = Vec::new();
        if let Some(ref system) = options.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }

        debug!(%url, model = %self.model, prompt_bytes = prompt.len(), "Requesting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout
                } else {
                    InferenceError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => InferenceError::Auth(text),
                429 => InferenceError::Quota(text),
                408 | 504 => InferenceError::Timeout,
                code => InferenceError::Request(format!("HTTP {}: {}", code, text.trim())),
            });
        }

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        data.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(str::to_string)
            .ok_or_else(|| InferenceError::Malformed("no message content in response".to_string()))
    }
}
