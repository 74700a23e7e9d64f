//! trainflow - Durable training pipeline orchestrator
//!
//! Runs a fixed sequence of stages (dataset preparation, training,
//! deployment) with per-stage retry policies, a shared failure route and a
//! single outcome notification per run.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - Runs waiting on a long retry are suspended and resumed later
//!
//! # Modules
//!
//! - `adapters`: Stage invokers (command, HTTP) and chat subscribers
//! - `core`: Orchestration logic (EventStore, Workflow, Retry, Executor)
//! - `domain`: Data structures (Event, Run, StageFailure, ExecutionOutcome)
//! - `notify`: Outcome sink and topic fan-out
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Start a run
//! echo '{"key": "card.xls"}' | trainflow run training
//!
//! # Check run status
//! trainflow status <run-id>
//!
//! # Continue runs whose retry is due
//! trainflow tick
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod notify;

// Re-export main types at crate root for convenience
pub use core::{
    CancelHandle, CatchHandler, ConfigError, ExecutorSettings, RetrySpec, StageDefinition,
    Workflow, WorkflowDefinition, WorkflowExecutor,
};
pub use domain::{
    Event, EventType, ExecutionOutcome, FailureKind, OutcomeMessage, Run, RunState, StageFailure,
    StagePayload, StageResult,
};
pub use notify::{NotificationSink, Subscriber, Topic};

pub use adapters::{StageInvoker, TelegramConfig};
