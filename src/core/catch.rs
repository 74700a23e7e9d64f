//! Catch routing for failures that retries did not absorb.
//!
//! Every stage points at the workflow's single failure state. When a stage
//! fails with a non-retryable kind or runs out of attempts, the executor hands
//! a [`CaughtFailure`] to the one [`CatchHandler`] it was built with and ends
//! the run. A catch never re-enters a stage.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::domain::StageFailure;

/// Failure delivered to the catch route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaughtFailure {
    pub run_id: Uuid,
    pub workflow: String,

    /// Failure state named by the stage's catch target
    pub target: String,

    /// Stage that failed
    pub stage: String,

    /// Attempt on which the stage gave up
    pub attempt: u32,

    /// Failure as reported by the stage
    pub failure: StageFailure,
}

impl CaughtFailure {
    /// The raw cause string sourced from the failing stage
    pub fn cause(&self) -> &str {
        &self.failure.cause
    }
}

/// Shared failure path reachable from every stage
///
/// Implementations must tolerate being called again for the same run after a
/// crash between the catch and the terminal event.
#[async_trait]
pub trait CatchHandler: Send + Sync {
    async fn catch(&self, failure: &CaughtFailure) -> Result<()>;
}

/// Catch handler that only records the failure in the log
pub struct LogCatchHandler;

#[async_trait]
impl CatchHandler for LogCatchHandler {
    async fn catch(&self, failure: &CaughtFailure) -> Result<()> {
        error!(
            run_id = %failure.run_id,
            target = %failure.target,
            stage = %failure.stage,
            attempt = failure.attempt,
            kind = %failure.failure.kind,
            cause = %failure.cause(),
            "Stage failure routed to catch target"
        );
        Ok(())
    }
}
