//! HTTP transport for the tool-invocation platform.
//!
//! Each call becomes `POST {endpoint}/tools/{tool_id}/execute` with a bearer
//! key. The platform answers `{ "successful": bool, "data": ..., "error": ... }`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ToolOutput, ToolRequest, ToolTransport};
use crate::config::ApiKey;
use crate::core::dispatcher::{is_valid_tool_id, DispatchError};

/// Platform response envelope
#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    #[serde(default)]
    successful: bool,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// Tool transport over HTTP
pub struct HttpToolTransport {
    endpoint: String,
    api_key: ApiKey,
    user_id: Option<String>,
    client: reqwest::Client,
}

impl HttpToolTransport {
    pub fn new(endpoint: impl Into<String>, api_key: ApiKey) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            user_id: None,
            client: reqwest::Client::new(),
        }
    }

    /// Scope calls to a platform user
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn url_for(&self, tool_id: &str) -> Result<String, DispatchError> {
        if !is_valid_tool_id(tool_id) {
            return Err(DispatchError::InvalidArgument(format!(
                "invalid tool id '{}'",
                tool_id
            )));
        }
        Ok(format!("{}/tools/{}/execute", self.endpoint, tool_id))
    }
}

#[async_trait]
impl ToolTransport for HttpToolTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        request: &ToolRequest,
        timeout: Duration,
    ) -> Result<ToolOutput, DispatchError> {
        let url = self.url_for(&request.tool_id)?;
        debug!(%url, call = %request.call_id, "Sending tool request");

        let body = json!({
            "call_id": request.call_id,
            "arguments": request.arguments,
            "inputs": request.inputs,
            "user_id": self.user_id,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    DispatchError::RemoteFailure(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 422 => DispatchError::InvalidArgument(text),
                408 | 504 => DispatchError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
                code => DispatchError::RemoteFailure(format!("HTTP {}: {}", code, text.trim())),
            });
        }

        let envelope: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::RemoteFailure(format!("unreadable response: {}", e)))?;

        if !envelope.successful {
            return Err(DispatchError::RemoteFailure(
                envelope.error.unwrap_or_else(|| "tool reported failure".to_string()),
            ));
        }

        let content = match envelope.data {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };

        Ok(ToolOutput::new(content))
    }
}
