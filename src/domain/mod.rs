//! Domain types for the cosci orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable audit records of run state changes
//! - Run: Run state rebuilt from events
//! - Payload: References to staged blobs
//! - Result: Call, step and run outcomes
//! - Synthesis: Structured final report

pub mod events;
pub mod payload;
pub mod result;
pub mod run;
pub mod synthesis;

// Re-export commonly used types
pub use events::{Event, EventType, StepStatus};
pub use payload::{ManifestEntry, PayloadRecord, PayloadRef};
pub use result::{
    AnalysisResult, CallRecord, ErrorKind, RunResult, StepError, StepInput, StepOutcome, Table,
    ToolCallResult,
};
pub use run::{Run, RunState};
pub use synthesis::FinalSynthesis;
