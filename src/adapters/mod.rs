//! Adapter interfaces for external systems.
//!
//! The core reaches the outside world only through these traits:
//! - [`ToolTransport`]: the tool-invocation platform
//! - [`InferenceClient`]: the language-model endpoint
//! - [`ScriptHost`]: the sandboxed script runner

pub mod http_tools;
pub mod llm;
pub mod sandbox;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::dispatcher::DispatchError;
use crate::domain::StepInput;

pub use http_tools::HttpToolTransport;
pub use llm::OpenAiCompatClient;
pub use sandbox::{Isolation, ProcessScriptHost, SandboxError};

/// A validated call as handed to the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub call_id: String,
    pub tool_id: String,

    /// Tool arguments (JSON object)
    pub arguments: serde_json::Value,

    /// Upstream inputs; staged data is passed by reference only
    #[serde(default)]
    pub inputs: Vec<StepInput>,
}

/// Output from a successful tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// The content returned by the tool
    pub content: String,
}

impl ToolOutput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Transport for tool calls
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Execute one call. `timeout` is advisory; the dispatcher enforces it.
    async fn execute(
        &self,
        request: &ToolRequest,
        timeout: Duration,
    ) -> Result<ToolOutput, DispatchError>;
}

/// Errors from the inference endpoint
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Inference quota exhausted: {0}")]
    Quota(String),

    #[error("Inference timed out")]
    Timeout,

    #[error("Inference authentication failed: {0}")]
    Auth(String),

    #[error("Inference request failed: {0}")]
    Request(String),

    #[error("Malformed inference response: {0}")]
    Malformed(String),
}

/// Options for a completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    /// Optional system instruction
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: 0.1,
            max_tokens: None,
        }
    }
}

/// Language-model completion endpoint
#[async_trait]
pub trait InferenceClient: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError>;
}

/// Resource ceilings for a sandboxed script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Wall-clock ceiling in seconds
    #[serde(default = "default_wall_clock")]
    pub wall_clock_seconds: u64,

    /// Address-space ceiling in megabytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// Largest stdout accepted from a script
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
}

fn default_wall_clock() -> u64 {
    120
}
fn default_memory_limit() -> u64 {
    1024
}
fn default_max_output() -> usize {
    64 * 1024
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_clock_seconds: default_wall_clock(),
            memory_limit_mb: default_memory_limit(),
            max_output_bytes: default_max_output(),
        }
    }
}

impl SandboxLimits {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_seconds)
    }
}

/// A file made visible to a script
#[derive(Debug, Clone)]
pub struct MountedInput {
    /// File name inside the inputs directory
    pub name: String,
    pub bytes: Vec<u8>,
}

/// What a script host needs to run a script
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub source: String,
    pub inputs: Vec<MountedInput>,
    pub limits: SandboxLimits,
}

/// Raw result of a script execution
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,

    /// Exit code (None if killed by a signal)
    pub exit_code: Option<i32>,

    /// Signal that terminated the script
    pub signal: Option<i32>,

    /// The wall-clock ceiling was hit
    pub timed_out: bool,

    /// The memory ceiling was hit
    pub memory_exceeded: bool,

    /// Stdout grew past `max_output_bytes` and the script was stopped
    pub output_exceeded: bool,
}

/// Sandboxed script runner
#[async_trait]
pub trait ScriptHost: Send + Sync {
    fn name(&self) -> &str;

    /// Run a script against mounted inputs under the given limits
    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput>;
}
