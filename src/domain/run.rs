//! Run state and reconstruction from events.
//!
//! A Run is the view of a single plan execution rebuilt from its audit log.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StepStatus};
use super::payload::PayloadRef;

/// A plan execution run as seen through its event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Goal of the recorded plan
    pub goal: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each step (ordinal -> status)
    pub step_statuses: BTreeMap<usize, StepStatus>,

    /// Intent of each step, from the recorded plan
    pub step_intents: BTreeMap<usize, String>,

    /// Last error recorded for each step
    pub step_errors: BTreeMap<usize, String>,

    /// Payloads staged during the run
    pub payloads: Vec<PayloadRef>,
}

impl Run {
    /// Create a new run
    pub fn new(id: Uuid, goal: String) -> Self {
        Self {
            id,
            goal,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            step_statuses: BTreeMap::new(),
            step_intents: BTreeMap::new(),
            step_errors: BTreeMap::new(),
            payloads: Vec::new(),
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(first_event.run_id, String::new());
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::PlanRecorded => {
                if let Some(ref data) = event.data {
                    self.record_plan(data);
                }
            }
            EventType::PayloadStaged => {
                let staged = event
                    .data
                    .as_ref()
                    .and_then(|d| serde_json::from_value::<PayloadRef>(d.clone()).ok());
                if let Some(reference) = staged {
                    if !self.payloads.contains(&reference) {
                        self.payloads.push(reference);
                    }
                }
            }
            EventType::StepStarted
            | EventType::CallRetrying
            | EventType::StepSucceeded
            | EventType::StepFailed
            | EventType::StepSkipped
            | EventType::StepCancelled => {
                if let Some(step) = event.step {
                    self.step_statuses.insert(step, event.status);
                    if let Some(ref error) = event.error {
                        self.step_errors.insert(step, error.clone());
                    }
                }
            }
            EventType::SafetyLimitReached => {
                self.state = RunState::SafetyLimitReached {
                    limit: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCompleted => {
                let failed = self
                    .step_statuses
                    .values()
                    .filter(|s| matches!(s, StepStatus::Failed | StepStatus::Skipped))
                    .count();
                if !matches!(self.state, RunState::SafetyLimitReached { .. }) {
                    self.state = if failed == 0 {
                        RunState::Completed
                    } else {
                        RunState::CompletedWithFailures { failed }
                    };
                }
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    fn record_plan(&mut self, plan: &serde_json::Value) {
        if let Some(goal) = plan.get("goal").and_then(|g| g.as_str()) {
            self.goal = goal.to_string();
        }
        let steps = plan.get("steps").and_then(|s| s.as_array());
        for (idx, step) in steps.into_iter().flatten().enumerate() {
            let ordinal = idx + 1;
            let intent = step
                .get("intent")
                .and_then(|i| i.as_str())
                .unwrap_or_default();
            self.step_intents.insert(ordinal, intent.to_string());
            self.step_statuses.entry(ordinal).or_default();
        }
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if the run has finished (successfully or not)
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Status of a specific step
    pub fn step_status(&self, ordinal: usize) -> StepStatus {
        self.step_statuses
            .get(&ordinal)
            .copied()
            .unwrap_or_default()
    }
}

/// State of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    Running,

    /// Every step succeeded
    Completed,

    /// Every step is terminal, some did not succeed
    CompletedWithFailures { failed: usize },

    /// Stopped by a cancellation request
    Cancelled,

    /// Safety limit was reached
    SafetyLimitReached { limit: String },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::CompletedWithFailures { failed } => {
                write!(f, "completed with {} unsuccessful step(s)", failed)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::SafetyLimitReached { limit } => write!(f, "safety limit reached: {}", limit),
        }
    }
}
