//! Step and run outcomes.
//!
//! Outcomes carry inline text only when it is under the staging threshold.
//! Staged data appears as [`PayloadRef`]s, never as raw bytes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::StepStatus;
use super::payload::{ManifestEntry, PayloadRef};
use super::run::RunState;
use super::synthesis::FinalSynthesis;

/// Flat error classification recorded in outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Planning,
    Timeout,
    RemoteFailure,
    InvalidArgument,
    Cancelled,
    NotFound,
    Storage,
    AnalysisTimeout,
    AnalysisResourceExceeded,
    AnalysisScriptError,
    Inference,
    Configuration,
    SafetyLimit,
    UpstreamFailed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Outcome of one tool call after staging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ToolCallResult {
    /// Small result returned as-is
    Inline { text: String },

    /// Oversized result moved into the payload store
    Staged { payload: PayloadRef },

    /// The call did not succeed
    Failed { kind: ErrorKind, message: String },
}

impl ToolCallResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn payload(&self) -> Option<&PayloadRef> {
        match self {
            Self::Staged { payload } => Some(payload),
            _ => None,
        }
    }
}

/// One call's record inside a step outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub tool_id: String,
    pub required: bool,

    /// Number of dispatch attempts made
    pub attempts: u32,

    pub result: ToolCallResult,
}

/// An input handed to a step from one of its upstream steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum StepInput {
    Inline {
        step: usize,
        call_id: String,
        text: String,
    },
    Staged {
        step: usize,
        call_id: String,
        payload: PayloadRef,
    },
    /// Upstream step did not succeed (lenient mode only)
    MissingUpstream { step: usize },
}

impl StepInput {
    pub fn upstream(&self) -> usize {
        match self {
            Self::Inline { step, .. } | Self::Staged { step, .. } | Self::MissingUpstream { step } => {
                *step
            }
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingUpstream { .. })
    }
}

/// Error captured for a failed, skipped or cancelled step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A named table in an analysis result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<serde_json::Value>>,
}

/// Structured output of an analysis step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Short text summary
    pub summary: String,

    /// Scalar metrics by name
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,

    #[serde(default)]
    pub tables: Vec<Table>,

    /// Keys of the payloads the analysis read
    #[serde(default)]
    pub inputs: Vec<String>,

    #[serde(default)]
    pub duration_ms: u64,
}

/// Final record of one plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub ordinal: usize,
    pub intent: String,
    pub status: StepStatus,

    /// Inputs the step received (empty for skipped steps)
    #[serde(default)]
    pub inputs: Vec<StepInput>,

    /// One record per requested call
    #[serde(default)]
    pub calls: Vec<CallRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,

    /// Validated report of a structured synthesis step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<FinalSynthesis>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,

    pub duration_ms: Option<u64>,
}

impl StepOutcome {
    pub fn pending(ordinal: usize, intent: impl Into<String>) -> Self {
        Self {
            ordinal,
            intent: intent.into(),
            status: StepStatus::Pending,
            inputs: Vec::new(),
            calls: Vec::new(),
            analysis: None,
            synthesis: None,
            error: None,
            duration_ms: None,
        }
    }

    /// Upstream ordinals flagged as missing in this step's inputs
    pub fn missing_upstream(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .filter(|i| i.is_missing())
            .map(StepInput::upstream)
            .collect()
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub plan_id: Uuid,
    pub goal: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Every step in plan order
    pub steps: Vec<StepOutcome>,

    /// Analysis results by step ordinal
    pub analyses: BTreeMap<usize, AnalysisResult>,

    /// All payloads staged during the run
    pub payloads: Vec<ManifestEntry>,
}

impl RunResult {
    pub fn step(&self, ordinal: usize) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.ordinal == ordinal)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::RemoteFailure.to_string(), "remote_failure");
        assert_eq!(ErrorKind::AnalysisTimeout.to_string(), "analysis_timeout");
    }

    #[test]
    fn test_missing_upstream_listing() {
        let mut outcome = StepOutcome::pending(3, "analyze");
        outcome.inputs = vec![
            StepInput::MissingUpstream { step: 1 },
            StepInput::Inline {
                step: 2,
                call_id: "pubchem".to_string(),
                text: "CCO".to_string(),
            },
        ];

        assert_eq!(outcome.missing_upstream(), vec![1]);
    }

    #[test]
    fn test_call_result_tagging() {
        let result = ToolCallResult::Failed {
            kind: ErrorKind::Timeout,
            message: "timed out after 30000ms".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "timeout");
        assert!(!result.is_success());
    }
}
