//! Tool dispatch.
//!
//! The dispatcher validates tool calls, sends them through a
//! [`ToolTransport`] and collects exactly one outcome per call. Calls
//! submitted together run as concurrent tasks with independent timeouts;
//! a failing call never aborts its siblings. Nothing is retried or
//! persisted here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{ToolOutput, ToolRequest, ToolTransport};
use crate::domain::{ErrorKind, StepInput};

/// Failure of a single tool call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Tool call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Remote failure: {0}")]
    RemoteFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tool call cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Transient failures the executor may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::RemoteFailure(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RemoteFailure(_) => ErrorKind::RemoteFailure,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// One requested tool call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSpec {
    /// Identifier unique within the step
    pub id: String,

    /// Tool and its arguments
    #[serde(flatten)]
    pub args: ToolArgs,

    /// Per-call timeout in milliseconds (falls back to the dispatcher default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Whether the step fails when this call fails
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ToolCallSpec {
    pub fn new(id: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            id: id.into(),
            args,
            timeout_ms: None,
            required: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().max(1) as u64);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Check the call as a whole: its timeout and its arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == Some(0) {
            return Err("timeout_ms must be at least 1".to_string());
        }
        self.args.validate()
    }
}

/// Tool ids are sent as a URL path segment: `[A-Za-z0-9_.-]`, no `..`,
/// no leading dot
pub fn is_valid_tool_id(tool_id: &str) -> bool {
    !tool_id.is_empty()
        && !tool_id.starts_with('.')
        && !tool_id.contains("..")
        && tool_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Arguments per known tool identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolArgs {
    /// Literature search over arXiv
    ArxivSearch {
        query: String,
        #[serde(default = "default_max_results")]
        max_results: u32,
    },

    /// Compound lookup in PubChem
    PubchemQuery {
        keywords: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compound_type: Option<String>,
    },

    /// Fetch a document by URL
    WebFetch { url: String },

    /// Publish a report page
    PublishReport {
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Any other platform tool, passed through as-is
    Custom {
        tool_id: String,
        #[serde(default = "empty_object")]
        arguments: serde_json::Value,
    },
}

fn default_max_results() -> u32 {
    10
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Upper bound on `max_results` for search tools
pub const MAX_SEARCH_RESULTS: u32 = 100;

impl ToolArgs {
    /// Identifier sent to the tool platform
    pub fn tool_id(&self) -> &str {
        match self {
            Self::ArxivSearch { .. } => "arxiv_search",
            Self::PubchemQuery { .. } => "pubchem_query",
            Self::WebFetch { .. } => "web_fetch",
            Self::PublishReport { .. } => "publish_report",
            Self::Custom { tool_id, .. } => tool_id,
        }
    }

    /// Check argument shape before anything leaves the process
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::ArxivSearch { query, max_results } => {
                if query.trim().is_empty() {
                    return Err("query cannot be empty".to_string());
                }
                if *max_results == 0 || *max_results > MAX_SEARCH_RESULTS {
                    return Err(format!(
                        "max_results must be between 1 and {}",
                        MAX_SEARCH_RESULTS
                    ));
                }
            }
            Self::PubchemQuery { keywords, .. } => {
                if keywords.is_empty() || keywords.iter().any(|k| k.trim().is_empty()) {
                    return Err("keywords must be a non-empty list of non-empty strings".to_string());
                }
            }
            Self::WebFetch { url } => {
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(format!("url must be http(s): {}", url));
                }
            }
            Self::PublishReport { title, .. } => {
                if title.trim().is_empty() {
                    return Err("title cannot be empty".to_string());
                }
            }
            Self::Custom { tool_id, arguments } => {
                if !is_valid_tool_id(tool_id) {
                    return Err(format!(
                        "invalid tool id '{}' (allowed: letters, digits, '_', '.', '-')",
                        tool_id
                    ));
                }
                if !arguments.is_object() {
                    return Err("arguments must be a JSON object".to_string());
                }
            }
        }
        Ok(())
    }

    /// Arguments as a JSON object, without the tool tag
    pub fn arguments(&self) -> serde_json::Value {
        if let Self::Custom { arguments, .. } = self {
            return arguments.clone();
        }

        let mut value = serde_json::to_value(self).unwrap_or_else(|_| empty_object());
        if let Some(map) = value.as_object_mut() {
            map.remove("tool");
        }
        value
    }
}

/// Outcomes of a batch, keyed by call id
pub type DispatchResults = BTreeMap<String, Result<ToolOutput, DispatchError>>;

/// Dispatches tool calls through a transport
#[derive(Clone)]
pub struct ToolDispatcher {
    transport: Arc<dyn ToolTransport>,
    default_timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(transport: Arc<dyn ToolTransport>, default_timeout: Duration) -> Self {
        Self {
            transport,
            default_timeout,
        }
    }

    /// Name of the underlying transport
    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    fn timeout_for(&self, call: &ToolCallSpec) -> Duration {
        call.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    /// Dispatch a single call
    pub async fn invoke_one(
        &self,
        call: &ToolCallSpec,
        inputs: &[StepInput],
        cancel: &CancellationToken,
    ) -> Result<ToolOutput, DispatchError> {
        let mut results = self.invoke(std::slice::from_ref(call), inputs, cancel).await;
        results
            .remove(&call.id)
            .unwrap_or_else(|| Err(DispatchError::RemoteFailure("call produced no result".to_string())))
    }

    /// Dispatch calls concurrently and wait for every one to finish.
    ///
    /// Call ids must be unique within the batch.
    pub async fn invoke(
        &self,
        calls: &[ToolCallSpec],
        inputs: &[StepInput],
        cancel: &CancellationToken,
    ) -> DispatchResults {
        let mut results = DispatchResults::new();
        let mut handles = Vec::with_capacity(calls.len());

        for call in calls {
            if let Err(reason) = call.validate() {
                warn!(call = %call.id, %reason, "Rejecting malformed tool call");
                results.insert(call.id.clone(), Err(DispatchError::InvalidArgument(reason)));
                continue;
            }

            let timeout = self.timeout_for(call);
            let request = ToolRequest {
                call_id: call.id.clone(),
                tool_id: call.args.tool_id().to_string(),
                arguments: call.args.arguments(),
                inputs: inputs.to_vec(),
            };
            let transport = Arc::clone(&self.transport);
            let token = cancel.clone();

            debug!(call = %call.id, tool = %request.tool_id, ?timeout, "Dispatching tool call");
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(DispatchError::Cancelled),
                    res = tokio::time::timeout(timeout, transport.execute(&request, timeout)) => match res {
                        Ok(inner) => inner,
                        Err(_) => Err(DispatchError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    },
                };
                (started.elapsed(), outcome)
            });
            handles.push((call.id.clone(), handle));
        }

        let ids: Vec<String> = handles.iter().map(|(id, _)| id.clone()).collect();
        let joined = join_all(handles.into_iter().map(|(_, h)| h)).await;

        for (id, joined) in ids.into_iter().zip(joined) {
            let outcome = match joined {
                Ok((elapsed, outcome)) => {
                    match &outcome {
                        Ok(output) => info!(
                            call = %id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            size_bytes = output.content.len(),
                            "Tool call succeeded"
                        ),
                        Err(e) => warn!(
                            call = %id,
                            elapsed_ms = elapsed.as_millis() as u64,
                            error = %e,
                            "Tool call failed"
                        ),
                    }
                    outcome
                }
                Err(join_error) => Err(DispatchError::RemoteFailure(format!(
                    "call task aborted: {}",
                    join_error
                ))),
            };
            results.insert(id, outcome);
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_args_tagging() {
        let call: ToolCallSpec = serde_json::from_value(json!({
            "id": "arxiv",
            "tool": "arxiv_search",
            "query": "quantum dots",
            "max_results": 5
        }))
        .unwrap();

        assert_eq!(call.args.tool_id(), "arxiv_search");
        assert!(call.required);
        assert_eq!(call.args.arguments(), json!({ "query": "quantum dots", "max_results": 5 }));
    }

    #[test]
    fn test_custom_tool_passthrough() {
        let args = ToolArgs::Custom {
            tool_id: "notion_create_page".to_string(),
            arguments: json!({ "title": "Report" }),
        };

        assert_eq!(args.tool_id(), "notion_create_page");
        assert!(args.validate().is_ok());
        assert_eq!(args.arguments(), json!({ "title": "Report" }));
    }

    #[test]
    fn test_validation_rules() {
        let empty_query = ToolArgs::ArxivSearch {
            query: "  ".to_string(),
            max_results: 5,
        };
        assert!(empty_query.validate().is_err());

        let too_many = ToolArgs::ArxivSearch {
            query: "q".to_string(),
            max_results: MAX_SEARCH_RESULTS + 1,
        };
        assert!(too_many.validate().is_err());

        let bad_url = ToolArgs::WebFetch {
            url: "file:///etc/passwd".to_string(),
        };
        assert!(bad_url.validate().is_err());

        let bad_custom = ToolArgs::Custom {
            tool_id: "x".to_string(),
            arguments: json!([1, 2]),
        };
        assert!(bad_custom.validate().is_err());
    }

    #[test]
    fn test_tool_id_is_a_single_path_segment() {
        for good in ["notion_create_page", "gmail.send", "web-search-2"] {
            assert!(is_valid_tool_id(good), "{}", good);
        }
        for bad in ["", "a/b", "../admin", "a..b", ".hidden", "two words", "caf\u{e9}"] {
            assert!(!is_valid_tool_id(bad), "{}", bad);
        }

        let traversal = ToolArgs::Custom {
            tool_id: "../../admin/reset".to_string(),
            arguments: json!({}),
        };
        assert!(traversal.validate().unwrap_err().contains("invalid tool id"));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut call = ToolCallSpec::new(
            "arxiv",
            ToolArgs::ArxivSearch {
                query: "q".to_string(),
                max_results: 5,
            },
        );
        assert!(call.validate().is_ok());

        call.timeout_ms = Some(0);
        assert!(call.validate().unwrap_err().contains("timeout_ms"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(DispatchError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(DispatchError::RemoteFailure("503".to_string()).is_retryable());
        assert!(!DispatchError::InvalidArgument("bad".to_string()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
    }
}
