//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only event logging
//! - Workflow: Workflow definitions, validation and invoker binding
//! - Retry: Per-stage retry policy evaluation
//! - Catch: The shared failure route
//! - Executor: Durable run state machine
//! - Runs: Run queries and out-of-band cancellation

pub mod catch;
pub mod event_store;
pub mod executor;
pub mod retry;
pub mod runs;
pub mod workflow;

// Re-export commonly used types
pub use catch::{CatchHandler, CaughtFailure, LogCatchHandler};
pub use event_store::{generate_idempotency_key, hash_input, EventStore, RunLease};
pub use executor::{CancelHandle, ExecutorSettings, WorkflowExecutor};
pub use retry::{RetryDecision, RetrySpec};
pub use workflow::{BoundStage, ConfigError, StageDefinition, Workflow, WorkflowDefinition};
