//! Safety limits and enforcement for plan execution.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of steps per plan and calls per step
//! - Prompt size (staged payloads keep prompts small; this is the backstop)
//! - Bytes returned by tools and bytes staged over the whole run
//! - Total run time

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::plan::{Plan, StepAction};

/// Safety limits for plan execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of steps per plan (default: 50)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Maximum concurrent calls in one step (default: 16)
    #[serde(default = "default_max_calls_per_step")]
    pub max_calls_per_step: u32,

    /// Maximum prompt size in bytes sent to the model (default: 32KB)
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Bytes all tool calls of a run may return (default: 64MB)
    #[serde(default = "default_max_tool_output_bytes")]
    pub max_tool_output_bytes: u64,

    /// Bytes a run may move into the payload store (default: 256MB)
    #[serde(default = "default_max_staged_bytes")]
    pub max_staged_bytes: u64,
}

fn default_max_steps() -> u32 {
    50
}
fn default_max_calls_per_step() -> u32 {
    16
}
fn default_max_prompt_bytes() -> u64 {
    32 * 1024
} // 32KB
fn default_run_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_tool_output_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_max_staged_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_calls_per_step: default_max_calls_per_step(),
            max_prompt_bytes: default_max_prompt_bytes(),
            run_timeout_seconds: default_run_timeout(),
            max_tool_output_bytes: default_max_tool_output_bytes(),
            max_staged_bytes: default_max_staged_bytes(),
        }
    }
}

impl SafetyLimits {
    /// Check a plan's shape before anything runs
    pub fn check_plan(&self, plan: &Plan) -> Result<(), SafetyViolation> {
        let steps = plan.len() as u32;
        if steps > self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: steps,
                limit: self.max_steps,
            });
        }

        for step in plan.steps() {
            if let StepAction::Tools { calls } = &step.action {
                let actual = calls.len() as u32;
                if actual > self.max_calls_per_step {
                    return Err(SafetyViolation::MaxCallsPerStep {
                        step: step.ordinal,
                        actual,
                        limit: self.max_calls_per_step,
                    });
                }
            }
        }

        Ok(())
    }

    /// Validate a prompt against the size limit
    pub fn validate_prompt(&self, prompt: &str) -> Result<(), SafetyViolation> {
        let size = prompt.len() as u64;
        if size > self.max_prompt_bytes {
            return Err(SafetyViolation::MaxPromptBytes {
                actual: size,
                limit: self.max_prompt_bytes,
            });
        }
        Ok(())
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        if tracker.output_bytes > self.max_tool_output_bytes {
            return Err(SafetyViolation::MaxToolOutputBytes {
                actual: tracker.output_bytes,
                limit: self.max_tool_output_bytes,
            });
        }

        if tracker.staged_bytes > self.max_staged_bytes {
            return Err(SafetyViolation::MaxStagedBytes {
                actual: tracker.staged_bytes,
                limit: self.max_staged_bytes,
            });
        }

        Ok(())
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Total bytes returned by tool calls
    pub output_bytes: u64,

    /// Total bytes moved into the payload store
    pub staged_bytes: u64,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            output_bytes: 0,
            staged_bytes: 0,
            started_at: Instant::now(),
        }
    }

    /// Add what a finished step returned and staged
    pub fn record_step(&mut self, output_bytes: u64, staged_bytes: u64) {
        self.output_bytes += output_bytes;
        self.staged_bytes += staged_bytes;
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum steps exceeded: {actual} > {limit}")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Step {step} has too many calls: {actual} > {limit}")]
    MaxCallsPerStep { step: usize, actual: u32, limit: u32 },

    #[error("Maximum prompt bytes exceeded: {actual} > {limit}")]
    MaxPromptBytes { actual: u64, limit: u64 },

    #[error("Tool output budget exceeded: {actual} > {limit} bytes")]
    MaxToolOutputBytes { actual: u64, limit: u64 },

    #[error("Staging budget exceeded: {actual} > {limit} bytes")]
    MaxStagedBytes { actual: u64, limit: u64 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
