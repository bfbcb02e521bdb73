//! Event types for the run audit log.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. The full plan is recorded before the first step starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only run log.
///
/// Events are the audit trail of a run. The status of any run can be
/// reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Ordinal of the step (if applicable)
    pub step: Option<usize>,

    /// Tool call within the step (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets, NO staged payload bytes)
    pub summary: String,

    /// Status of the step/run after this event
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished steps)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured data attached to the event (the plan, a payload reference)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        step: Option<usize>,
        event_type: EventType,
        summary: impl Into<String>,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            step,
            call_id: None,
            event_type,
            summary: summary.into(),
            status,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    /// Attach the tool call this event refers to
    pub fn with_call(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// The full plan was recorded (before any step runs)
    PlanRecorded,

    /// A step has started execution
    StepStarted,

    /// A failed tool call is being retried
    CallRetrying,

    /// An oversized result was moved into the payload store
    PayloadStaged,

    /// A step succeeded
    StepSucceeded,

    /// A step failed
    StepFailed,

    /// A step was skipped because an upstream step did not succeed
    StepSkipped,

    /// A step was interrupted by cancellation
    StepCancelled,

    /// A safety limit was reached, halting execution
    SafetyLimitReached,

    /// All steps reached a terminal state
    RunCompleted,

    /// The run was cancelled
    RunCancelled,
}

/// Status of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Succeeded,

    /// Failed (with error)
    Failed,

    /// Not run because an upstream step did not succeed
    Skipped,

    /// Interrupted by run cancellation
    Cancelled,
}

impl StepStatus {
    /// Whether the step can no longer change state
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
