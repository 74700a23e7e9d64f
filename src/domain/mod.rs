//! Domain types for the trainflow executor.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of state changes
//! - Run: Workflow execution state
//! - Failure: Stage results and the failure taxonomy
//! - Outcome: Terminal results and notification messages

pub mod events;
pub mod failure;
pub mod outcome;
pub mod run;

// Re-export commonly used types
pub use events::{Event, EventType, StageStatus};
pub use failure::{FailureKind, StageFailure, StagePayload, StageResult};
pub use outcome::{ExecutionOutcome, OutcomeMessage};
pub use run::{Run, RunState};
