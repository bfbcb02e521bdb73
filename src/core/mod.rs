//! Core research pipeline logic.
//!
//! This module contains:
//! - Plan: Plan definitions, validation and loading
//! - Planner: Goal decomposition through the inference endpoint
//! - Dispatcher: Concurrent tool calls with per-call timeouts
//! - PayloadStore: Content-addressed staging of oversized results
//! - Analysis: Bounded scripts over staged payloads
//! - EventStore: Append-only run log
//! - Safety: Safety limits and enforcement
//! - Executor: Main execution engine

pub mod analysis;
pub mod dispatcher;
pub mod event_store;
pub mod executor;
pub mod payload_store;
pub mod plan;
pub mod planner;
pub mod safety;

// Re-export commonly used types
pub use analysis::{AnalysisError, AnalysisRunner, AnalysisScriptSpec, InlineInput};
pub use dispatcher::{DispatchError, DispatchResults, ToolArgs, ToolCallSpec, ToolDispatcher};
pub use event_store::EventStore;
pub use executor::{ExecutionMode, Executor, ExecutorOptions, DEFAULT_INLINE_THRESHOLD};
pub use payload_store::{content_key, should_stage, GcReport, PayloadError, PayloadStore};
pub use plan::{Plan, PlanStep, PlanningError, RetryPolicy, StepAction, SynthesisFormat};
pub use planner::Planner;
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
