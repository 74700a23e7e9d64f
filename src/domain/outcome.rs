//! Terminal outcomes of a workflow run.
//!
//! Every run ends in exactly one [`ExecutionOutcome`], which is wrapped in an
//! [`OutcomeMessage`] and handed to the notification sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::failure::StagePayload;

/// The single terminal result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ExecutionOutcome {
    /// The final stage succeeded; carries its output payload
    Success { payload: StagePayload },

    /// A stage failed for good; carries the raw cause
    Failure { cause: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Message published to the notification sink when a run terminates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMessage {
    /// Run that produced the outcome
    pub run_id: Uuid,

    /// Workflow name
    pub workflow: String,

    /// When the run reached its terminal state
    pub finished_at: DateTime<Utc>,

    /// The outcome itself
    pub outcome: ExecutionOutcome,
}

impl OutcomeMessage {
    pub fn new(run_id: Uuid, workflow: String, outcome: ExecutionOutcome) -> Self {
        Self {
            run_id,
            workflow,
            finished_at: Utc::now(),
            outcome,
        }
    }

    /// Message body: the final payload on success, the cause string on failure
    pub fn body(&self) -> String {
        match &self.outcome {
            ExecutionOutcome::Success { payload } => payload.to_string(),
            ExecutionOutcome::Failure { cause } => cause.clone(),
        }
    }

    /// One-line rendering for chat channels
    pub fn to_text(&self) -> String {
        let label = if self.outcome.is_success() {
            "Success"
        } else {
            "Failure"
        };
        format!("[{}] {} ({}): {}", label, self.workflow, self.run_id, self.body())
    }
}
