//! cosci - Research pipeline orchestrator
//!
//! Turns a research goal into an ordered plan of steps, fans each step's
//! tool calls out concurrently, stages oversized results in a
//! content-addressed payload store and runs bounded analysis scripts over
//! them, so only summaries ever reach the language model.
//!
//! # Architecture
//!
//! - A [`Plan`] is immutable once validated; steps run strictly in order
//! - Every state change is appended to a per-run JSONL event log
//! - Large results travel as [`PayloadRef`]s, never as raw bytes
//!
//! # Modules
//!
//! - `adapters`: External system integrations (tool platform, LLM, script host)
//! - `core`: Plan, Dispatcher, PayloadStore, Analysis, Executor
//! - `domain`: Data structures (Event, Run, PayloadRef, RunResult)
//! - `config`: Configuration resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Plan and run a goal
//! cosci run "Find recent work on graphene quantum dots for bioimaging"
//!
//! # Run an edited plan, keeping dependents of failed steps
//! cosci run "graphene dots" --plan plan.yaml --lenient
//!
//! # Check run status
//! cosci status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::{ApiKey, Config};
pub use core::{
    AnalysisRunner, ExecutionMode, Executor, ExecutorOptions, PayloadStore, Plan, PlanStep,
    Planner, ToolDispatcher,
};
pub use domain::{Event, EventType, PayloadRef, Run, RunResult, RunState, StepStatus};
