//! Plan definitions and validation.
//!
//! A plan is an ordered list of steps created once per run. Each step names
//! its action and the earlier steps whose outputs it consumes. Plans come
//! from the planner or from a YAML file and are validated the same way.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::analysis::AnalysisScriptSpec;
use super::dispatcher::ToolCallSpec;
use crate::domain::StepStatus;

/// Errors raised while creating or validating a plan
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("Goal is empty")]
    EmptyGoal,

    #[error("Goal could not be decomposed into any actionable step")]
    NoActionableSteps,

    #[error("Step {ordinal} is invalid: {reason}")]
    InvalidStep { ordinal: usize, reason: String },

    #[error("Planner output could not be parsed: {0}")]
    Malformed(String),

    #[error("Inference failed while planning: {0}")]
    Inference(#[from] crate::adapters::InferenceError),
}

/// A complete plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    /// The research goal this plan decomposes
    pub goal: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Ordered steps; the count never changes after creation
    steps: Vec<PlanStep>,
}

impl Plan {
    /// Build and validate a plan. Ordinals are assigned from position.
    pub fn new(goal: impl Into<String>, steps: Vec<PlanStep>) -> Result<Self, PlanningError> {
        let mut plan = Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            created_at: Utc::now(),
            steps,
        };
        plan.normalize();
        plan.validate()?;
        Ok(plan)
    }

    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a plan from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut plan: Self = serde_yaml::from_str(content).context("Failed to parse plan YAML")?;
        plan.normalize();
        plan.validate()?;
        Ok(plan)
    }

    fn normalize(&mut self) {
        for (idx, step) in self.steps.iter_mut().enumerate() {
            step.ordinal = idx + 1;
            step.status = StepStatus::Pending;
        }
    }

    /// Validate the plan definition
    pub fn validate(&self) -> Result<(), PlanningError> {
        if self.goal.trim().is_empty() {
            return Err(PlanningError::EmptyGoal);
        }

        if self.steps.is_empty() {
            return Err(PlanningError::NoActionableSteps);
        }

        for (idx, step) in self.steps.iter().enumerate() {
            let ordinal = idx + 1;
            let invalid = |reason: String| PlanningError::InvalidStep { ordinal, reason };

            if step.ordinal != ordinal {
                return Err(invalid(format!(
                    "ordinal {} does not match position {}",
                    step.ordinal, ordinal
                )));
            }

            if step.intent.trim().is_empty() {
                return Err(invalid("intent cannot be empty".to_string()));
            }

            // Dependencies may only point backwards, which also rules out cycles
            let mut seen = HashSet::new();
            for &upstream in &step.depends_on {
                if upstream == 0 || upstream >= ordinal {
                    return Err(invalid(format!(
                        "depends on step {} (only earlier steps allowed)",
                        upstream
                    )));
                }
                if !seen.insert(upstream) {
                    return Err(invalid(format!("depends on step {} twice", upstream)));
                }
            }

            match &step.action {
                StepAction::Tools { calls } => {
                    if calls.is_empty() {
                        return Err(invalid("declares no tool calls".to_string()));
                    }
                    let mut ids = HashSet::new();
                    for call in calls {
                        if call.id.trim().is_empty() {
                            return Err(invalid("tool call with empty id".to_string()));
                        }
                        if !ids.insert(call.id.as_str()) {
                            return Err(invalid(format!("duplicate call id '{}'", call.id)));
                        }
                        call.validate()
                            .map_err(|e| invalid(format!("call '{}': {}", call.id, e)))?;
                    }
                }
                StepAction::Analysis { script } => {
                    if script.source.trim().is_empty() {
                        return Err(invalid("analysis script is empty".to_string()));
                    }
                    if step.depends_on.is_empty() {
                        return Err(invalid("analysis step has no upstream inputs".to_string()));
                    }
                }
                StepAction::Synthesis { instruction, .. } => {
                    if instruction.trim().is_empty() {
                        return Err(invalid("synthesis instruction is empty".to_string()));
                    }
                }
            }
        }

        Ok(())
    }

    /// All steps in order
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Get a step by ordinal (1-based)
    pub fn step(&self, ordinal: usize) -> Option<&PlanStep> {
        ordinal.checked_sub(1).and_then(|idx| self.steps.get(idx))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn set_status(&mut self, ordinal: usize, status: StepStatus) {
        if let Some(step) = ordinal.checked_sub(1).and_then(|idx| self.steps.get_mut(idx)) {
            step.status = status;
        }
    }

    /// Whether any step needs the inference endpoint
    pub fn needs_inference(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.action, StepAction::Synthesis { .. }))
    }

    /// Human-readable listing for auditing before execution
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Plan {} ({} steps)", self.id, self.steps.len());
        let _ = writeln!(out, "Goal: {}", self.goal);

        for step in &self.steps {
            let _ = write!(out, "  {}. [{}] {}", step.ordinal, step.action.label(), step.intent);
            if !step.depends_on.is_empty() {
                let deps: Vec<String> = step.depends_on.iter().map(|d| d.to_string()).collect();
                let _ = write!(out, " <- {}", deps.join(", "));
            }
            let _ = writeln!(out);

            if let StepAction::Tools { calls } = &step.action {
                for call in calls {
                    let _ = writeln!(
                        out,
                        "       - {} -> {}{}",
                        call.id,
                        call.args.tool_id(),
                        if call.required { "" } else { " (optional)" }
                    );
                }
            }
        }

        out
    }
}

/// A single step in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    /// Position in the plan (1-based, assigned on creation)
    #[serde(default)]
    pub ordinal: usize,

    /// Human-readable intent
    pub intent: String,

    /// What the step does
    #[serde(flatten)]
    pub action: StepAction,

    /// Earlier steps whose outputs this step consumes
    #[serde(default)]
    pub depends_on: Vec<usize>,

    #[serde(default)]
    pub status: StepStatus,

    /// Override of the run's retry policy for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl PlanStep {
    /// A step that fans out the given calls
    pub fn tools(intent: impl Into<String>, calls: Vec<ToolCallSpec>) -> Self {
        Self::with_action(intent, StepAction::Tools { calls })
    }

    /// A step that runs an analysis script over upstream outputs
    pub fn analysis(intent: impl Into<String>, script: AnalysisScriptSpec) -> Self {
        Self::with_action(intent, StepAction::Analysis { script })
    }

    /// A step that asks the model to synthesize upstream outputs
    pub fn synthesis(intent: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self::with_action(
            intent,
            StepAction::Synthesis {
                instruction: instruction.into(),
                format: SynthesisFormat::Text,
            },
        )
    }

    /// A synthesis step that must return a validated final report
    pub fn final_report(intent: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self::with_action(
            intent,
            StepAction::Synthesis {
                instruction: instruction.into(),
                format: SynthesisFormat::Structured,
            },
        )
    }

    fn with_action(intent: impl Into<String>, action: StepAction) -> Self {
        Self {
            ordinal: 0,
            intent: intent.into(),
            action,
            depends_on: Vec::new(),
            status: StepStatus::Pending,
            retry_policy: None,
        }
    }

    /// Declare upstream dependencies
    pub fn depends_on(mut self, upstream: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on = upstream.into_iter().collect();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// What a step does
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// One or more tool calls; several calls are dispatched concurrently
    Tools { calls: Vec<ToolCallSpec> },

    /// Sandboxed script over staged upstream payloads
    Analysis { script: AnalysisScriptSpec },

    /// Synthesis by the inference endpoint
    Synthesis {
        instruction: String,
        #[serde(default, skip_serializing_if = "SynthesisFormat::is_text")]
        format: SynthesisFormat,
    },
}

/// What a synthesis step must return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisFormat {
    /// Free text
    #[default]
    Text,

    /// A JSON final report checked against its schema
    Structured,
}

impl SynthesisFormat {
    fn is_text(&self) -> bool {
        *self == Self::Text
    }
}

impl StepAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tools { .. } => "tools",
            Self::Analysis { .. } => "analysis",
            Self::Synthesis { .. } => "synthesis",
        }
    }
}

/// Retry policy for transient call failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
