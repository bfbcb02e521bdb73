//! Analysis runner.
//!
//! Runs a bounded script against staged payloads through a [`ScriptHost`].
//! Payloads are dereferenced here, mounted as files, and never echoed back:
//! the script must print a single JSON object with a short `summary`,
//! optional `metrics` and optional `tables`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::payload_store::{PayloadError, PayloadStore};
use crate::adapters::{MountedInput, SandboxError, SandboxLimits, ScriptHost, ScriptRequest};
use crate::domain::{AnalysisResult, ErrorKind, PayloadRef, Table};

/// Longest summary an analysis may return
pub const MAX_SUMMARY_CHARS: usize = 2_000;

/// Longest diagnostic tail attached to errors
const MAX_DIAGNOSTIC_BYTES: usize = 4_096;

/// Slack added on top of the host's own wall-clock enforcement
const HOST_GRACE: Duration = Duration::from_secs(5);

/// Analysis failures
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis timed out after {limit_seconds}s")]
    Timeout {
        limit_seconds: u64,
        diagnostics: String,
    },

    #[error("Analysis exceeded resource limits: {reason}")]
    ResourceExceeded { reason: String, diagnostics: String },

    #[error("Analysis script failed: {reason}")]
    ScriptError {
        reason: String,
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("Analysis input unavailable: {0}")]
    Input(#[from] PayloadError),

    #[error("Analysis host misconfigured: {0}")]
    Configuration(String),

    #[error("Analysis cancelled")]
    Cancelled,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::AnalysisTimeout,
            Self::ResourceExceeded { .. } => ErrorKind::AnalysisResourceExceeded,
            Self::ScriptError { .. } => ErrorKind::AnalysisScriptError,
            Self::Input(e) => e.kind(),
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Captured script output attached to the error
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Timeout { diagnostics, .. }
            | Self::ResourceExceeded { diagnostics, .. }
            | Self::ScriptError { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Script to run in an analysis step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisScriptSpec {
    /// Script source for the configured interpreter
    pub source: String,

    /// Tighter wall-clock ceiling for this script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Tighter memory ceiling for this script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u64>,
}

impl AnalysisScriptSpec {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            timeout_seconds: None,
            memory_limit_mb: None,
        }
    }
}

/// Small upstream text handed to a script next to the staged payloads
#[derive(Debug, Clone, PartialEq)]
pub struct InlineInput {
    pub step: usize,
    pub call_id: String,
    pub text: String,
}

/// Shape a script must print on stdout
#[derive(Debug, Deserialize)]
struct ScriptReport {
    summary: String,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    tables: Vec<Table>,
}

fn tail(text: &str) -> String {
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Runs analysis scripts over staged payloads
#[derive(Clone)]
pub struct AnalysisRunner {
    host: Arc<dyn ScriptHost>,
    store: Arc<PayloadStore>,
    limits: SandboxLimits,
}

impl AnalysisRunner {
    pub fn new(host: Arc<dyn ScriptHost>, store: Arc<PayloadStore>, limits: SandboxLimits) -> Self {
        Self {
            host,
            store,
            limits,
        }
    }

    /// Configured ceilings narrowed by the script's own requests
    fn effective_limits(&self, script: &AnalysisScriptSpec) -> SandboxLimits {
        let mut limits = self.limits.clone();
        if let Some(seconds) = script.timeout_seconds {
            limits.wall_clock_seconds = limits.wall_clock_seconds.min(seconds.max(1));
        }
        if let Some(mb) = script.memory_limit_mb {
            limits.memory_limit_mb = limits.memory_limit_mb.min(mb.max(1));
        }
        limits
    }

    /// Run `script` over the given payloads
    pub async fn analyze(
        &self,
        inputs: &[PayloadRef],
        script: &AnalysisScriptSpec,
    ) -> Result<AnalysisResult, AnalysisError> {
        self.analyze_with_context(inputs, &[], script, &CancellationToken::new())
            .await
    }

    /// Run `script` over payloads plus small inline upstream texts
    #[instrument(skip_all, fields(payloads = inputs.len(), inline = inline.len()))]
    pub async fn analyze_with_context(
        &self,
        inputs: &[PayloadRef],
        inline: &[InlineInput],
        script: &AnalysisScriptSpec,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalysisError> {
        let limits = self.effective_limits(script);
        let mut mounts = Vec::with_capacity(inputs.len() + inline.len() + 1);
        let mut manifest = Vec::new();

        for (idx, reference) in inputs.iter().enumerate() {
            let bytes = self.store.get(reference).await?;
            let name = format!("payload_{}.txt", idx + 1);
            manifest.push(json!({
                "file": name,
                "key": reference.key,
                "size_bytes": reference.size_bytes,
            }));
            mounts.push(MountedInput { name, bytes });
        }

        for (idx, input) in inline.iter().enumerate() {
            let name = format!("inline_{}.txt", idx + 1);
            manifest.push(json!({
                "file": name,
                "step": input.step,
                "call_id": input.call_id,
                "size_bytes": input.text.len(),
            }));
            mounts.push(MountedInput {
                name,
                bytes: input.text.clone().into_bytes(),
            });
        }

        mounts.push(MountedInput {
            name: "manifest.json".to_string(),
            bytes: serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
        });

        let request = ScriptRequest {
            source: script.source.clone(),
            inputs: mounts,
            limits: limits.clone(),
        };

        let started = Instant::now();
        let ceiling = limits.wall_clock() + HOST_GRACE;
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AnalysisError::Cancelled),
            res = tokio::time::timeout(ceiling, self.host.execute(request)) => match res {
                Err(_) => {
                    return Err(AnalysisError::Timeout {
                        limit_seconds: limits.wall_clock_seconds,
                        diagnostics: String::new(),
                    })
                }
                Ok(Err(e)) => {
                    if let Some(setup) = e.downcast_ref::<SandboxError>() {
                        return Err(AnalysisError::Configuration(setup.to_string()));
                    }
                    return Err(AnalysisError::ScriptError {
                        reason: format!("script host failed: {:#}", e),
                        exit_code: None,
                        diagnostics: String::new(),
                    })
                }
                Ok(Ok(output)) => output,
            },
        };

        let diagnostics = tail(&output.stderr);

        if output.timed_out {
            return Err(AnalysisError::Timeout {
                limit_seconds: limits.wall_clock_seconds,
                diagnostics,
            });
        }

        if output.output_exceeded {
            return Err(AnalysisError::ResourceExceeded {
                reason: format!("output exceeds {} bytes", limits.max_output_bytes),
                diagnostics,
            });
        }

        if output.memory_exceeded {
            return Err(AnalysisError::ResourceExceeded {
                reason: format!("memory ceiling of {}MB", limits.memory_limit_mb),
                diagnostics,
            });
        }

        if output.stdout.len() > limits.max_output_bytes {
            return Err(AnalysisError::ResourceExceeded {
                reason: format!(
                    "output of {} bytes exceeds {} bytes",
                    output.stdout.len(),
                    limits.max_output_bytes
                ),
                diagnostics,
            });
        }

        if output.exit_code != Some(0) {
            return Err(AnalysisError::ScriptError {
                reason: match output.exit_code {
                    Some(code) => format!("exited with status {}", code),
                    None => match output.signal {
                        Some(signal) => format!("terminated by signal {}", signal),
                        None => "terminated by signal".to_string(),
                    },
                },
                exit_code: output.exit_code,
                diagnostics,
            });
        }

        let report: ScriptReport = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            AnalysisError::ScriptError {
                reason: format!("malformed output: {}", e),
                exit_code: output.exit_code,
                diagnostics: if diagnostics.is_empty() {
                    tail(&output.stdout)
                } else {
                    diagnostics.clone()
                },
            }
        })?;

        if report.summary.chars().count() > MAX_SUMMARY_CHARS {
            return Err(AnalysisError::ScriptError {
                reason: format!("summary longer than {} characters", MAX_SUMMARY_CHARS),
                exit_code: output.exit_code,
                diagnostics,
            });
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            duration_ms,
            metrics = report.metrics.len(),
            tables = report.tables.len(),
            "Analysis finished"
        );
        if !output.stderr.is_empty() {
            warn!(stderr_bytes = output.stderr.len(), "Analysis script wrote to stderr");
        }

        Ok(AnalysisResult {
            summary: report.summary,
            metrics: report.metrics,
            tables: report.tables,
            inputs: inputs.iter().map(|r| r.key.clone()).collect(),
            duration_ms,
        })
    }
}
