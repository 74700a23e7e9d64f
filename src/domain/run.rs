//! Run state and reconstruction from events.
//!
//! A Run represents a single execution of a workflow. Its durable record is
//! the stage index, attempt counter and current payload, all of which are
//! rebuilt from the event log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StageStatus};
use super::failure::{StageFailure, StagePayload};
use super::outcome::ExecutionOutcome;

/// A workflow execution run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the workflow being executed
    pub workflow_name: String,

    /// Input provided to the first stage
    pub input: StagePayload,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Index of the stage being executed
    pub stage_index: usize,

    /// Attempt number of the current stage (1-indexed)
    pub attempt: u32,

    /// Payload the current stage will receive
    pub payload: StagePayload,

    /// Attempts made per stage
    pub stage_attempts: HashMap<String, u32>,

    /// Status of each stage (stage_name -> status)
    pub stage_statuses: HashMap<String, StageStatus>,

    /// Most recent stage failure
    pub last_failure: Option<StageFailure>,

    /// Whether the terminal outcome has been handed to the sink
    pub outcome_published: bool,
}

impl Run {
    /// Create a new run for a workflow
    pub fn new(id: Uuid, workflow_name: String, input: StagePayload) -> Self {
        Self {
            id,
            workflow_name,
            payload: input.clone(),
            input,
            state: RunState::Running,
            started_at: Utc::now(),
            completed_at: None,
            stage_index: 0,
            attempt: 1,
            stage_attempts: HashMap::new(),
            stage_statuses: HashMap::new(),
            last_failure: None,
            outcome_published: false,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(first_event.run_id, String::new(), StagePayload::Null);
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        // Once terminal only the publish marker still matters; a late stage
        // event from a racing writer must not reopen the run.
        if self.is_finished() && event.event_type != EventType::OutcomePublished {
            return;
        }

        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
                if let Some(ref workflow) = event.workflow {
                    self.workflow_name = workflow.clone();
                }
                if let Some(ref input) = event.payload {
                    self.input = input.clone();
                    self.payload = input.clone();
                }
                self.stage_index = 0;
                self.attempt = 1;
            }
            EventType::StageStarted => {
                self.state = RunState::Running;
                if let Some(index) = event.stage_index {
                    self.stage_index = index;
                }
                if let Some(attempt) = event.attempt {
                    self.attempt = attempt;
                }
                if let Some(ref stage_id) = event.stage_id {
                    self.stage_statuses
                        .insert(stage_id.clone(), StageStatus::Running);
                    self.stage_attempts.insert(stage_id.clone(), self.attempt);
                }
            }
            EventType::StageCompleted => {
                if let Some(ref payload) = event.payload {
                    self.payload = payload.clone();
                }
                if let Some(ref stage_id) = event.stage_id {
                    self.stage_statuses
                        .insert(stage_id.clone(), StageStatus::Completed);
                }
                self.stage_index += 1;
                self.attempt = 1;
            }
            EventType::StageRetryScheduled => {
                let wait_until = event.wait_until.unwrap_or(event.timestamp);
                self.state = RunState::Retrying { wait_until };
                self.attempt = event.attempt.unwrap_or(self.attempt) + 1;
                self.last_failure = event.failure.clone();
                if let Some(ref stage_id) = event.stage_id {
                    self.stage_statuses
                        .insert(stage_id.clone(), StageStatus::Retrying);
                }
            }
            EventType::StageFailed => {
                self.last_failure = event.failure.clone();
                if let Some(ref stage_id) = event.stage_id {
                    self.stage_statuses
                        .insert(stage_id.clone(), StageStatus::Failed);
                }
            }
            EventType::CatchInvoked => {}
            EventType::RunSucceeded => {
                self.state = RunState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    cause: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunCancelled => {
                self.state = RunState::Cancelled;
                self.completed_at = Some(event.timestamp);
                if let Some(ref stage_id) = event.stage_id {
                    self.stage_statuses
                        .insert(stage_id.clone(), StageStatus::Cancelled);
                }
            }
            EventType::OutcomePublished => {
                self.outcome_published = true;
            }
        }
    }

    /// Check if the run is still in progress (running or waiting to retry)
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running | RunState::Retrying { .. })
    }

    /// Check if the run has reached a terminal state
    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    /// Whether a scheduler should drive this run at `now`
    ///
    /// True for runs left mid-stage, retries whose wait has elapsed, and
    /// finished runs whose outcome never reached the sink.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            RunState::Running => true,
            RunState::Retrying { wait_until } => *wait_until <= now,
            RunState::Succeeded | RunState::Failed { .. } => !self.outcome_published,
            RunState::Cancelled => false,
        }
    }

    /// Number of attempts made for a stage
    pub fn attempts_for(&self, stage_name: &str) -> u32 {
        self.stage_attempts.get(stage_name).copied().unwrap_or(0)
    }

    /// The terminal outcome, if the run succeeded or failed
    ///
    /// Cancelled runs have no outcome.
    pub fn outcome(&self) -> Option<ExecutionOutcome> {
        match &self.state {
            RunState::Succeeded => Some(ExecutionOutcome::Success {
                payload: self.payload.clone(),
            }),
            RunState::Failed { cause } => Some(ExecutionOutcome::Failure {
                cause: cause.clone(),
            }),
            _ => None,
        }
    }
}

/// State of a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// A stage attempt is due or in flight
    Running,

    /// Waiting for a scheduled retry of the current stage
    Retrying { wait_until: DateTime<Utc> },

    /// Final stage succeeded
    Succeeded,

    /// A stage failure reached the catch route
    Failed { cause: String },

    /// Stopped externally between attempts
    Cancelled,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Running
    }
}

impl RunState {
    /// Short lowercase label for listings
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Retrying { .. } => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(run_id: Uuid, stage: Option<&str>, event_type: EventType) -> Event {
        Event::new(
            run_id,
            stage.map(str::to_string),
            event_type,
            format!("{}:test", run_id),
            "test".to_string(),
            StageStatus::Running,
        )
    }

    #[test]
    fn test_run_creation() {
        let run_id = Uuid::new_v4();
        let run = Run::new(run_id, "training".to_string(), json!({"key": "card.xls"}));

        assert_eq!(run.id, run_id);
        assert_eq!(run.workflow_name, "training");
        assert_eq!(run.stage_index, 0);
        assert_eq!(run.attempt, 1);
        assert!(run.is_running());
    }

    #[test]
    fn test_run_from_events() {
        let run_id = Uuid::new_v4();

        let events = vec![
            event(run_id, None, EventType::RunStarted)
                .with_workflow("training")
                .with_payload(json!({"key": "card.xls"})),
            event(run_id, Some("dataset"), EventType::StageStarted).with_attempt(0, 1),
            event(run_id, Some("dataset"), EventType::StageCompleted)
                .with_attempt(0, 1)
                .with_payload(json!({"job_name": "job-1"})),
            event(run_id, Some("train"), EventType::StageStarted).with_attempt(1, 1),
            event(run_id, Some("train"), EventType::StageRetryScheduled)
                .with_attempt(1, 1)
                .with_failure(StageFailure::transient("in-progress"))
                .with_wait_until(Utc::now()),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(run.workflow_name, "training");
        assert_eq!(run.input, json!({"key": "card.xls"}));
        assert_eq!(run.payload, json!({"job_name": "job-1"}));
        assert_eq!(run.stage_index, 1);
        assert_eq!(run.attempt, 2);
        assert!(matches!(run.state, RunState::Retrying { .. }));
        assert_eq!(run.stage_statuses["dataset"], StageStatus::Completed);
        assert_eq!(run.attempts_for("train"), 1);
    }

    #[test]
    fn test_terminal_state_ignores_late_stage_events() {
        let run_id = Uuid::new_v4();

        let events = vec![
            event(run_id, None, EventType::RunStarted).with_payload(json!({})),
            event(run_id, None, EventType::RunCancelled),
            event(run_id, Some("train"), EventType::StageStarted).with_attempt(1, 3),
            event(run_id, None, EventType::OutcomePublished),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(run.state, RunState::Cancelled);
        assert_eq!(run.stage_index, 0);
        assert!(run.outcome_published);
        assert!(run.outcome().is_none());
    }

    #[test]
    fn test_failed_run_outcome_carries_cause() {
        let run_id = Uuid::new_v4();

        let events = vec![
            event(run_id, None, EventType::RunStarted).with_payload(json!({})),
            event(run_id, None, EventType::RunFailed).with_error("bad input".to_string()),
        ];

        let run = Run::from_events(&events).unwrap();

        assert_eq!(
            run.outcome(),
            Some(ExecutionOutcome::Failure {
                cause: "bad input".to_string()
            })
        );
        assert_eq!(run.state.label(), "failed");
        assert!(run.is_due(Utc::now()));
    }

    #[test]
    fn test_retrying_run_is_due_after_wait() {
        let mut run = Run::new(Uuid::new_v4(), "training".to_string(), json!({}));
        let wait_until = Utc::now() + chrono::Duration::minutes(5);
        run.state = RunState::Retrying { wait_until };

        assert!(!run.is_due(Utc::now()));
        assert!(run.is_due(wait_until));

        run.state = RunState::Cancelled;
        assert!(!run.is_due(wait_until));
    }
}
