//! Event types for the event-sourced workflow executor.
//!
//! All state changes are recorded as immutable events in an append-only log.
//! Replaying a run's log reconstructs its stage index, attempt counter and
//! current payload, which is what lets a run outlive the process that started it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::failure::{StageFailure, StagePayload};

/// A single event in the append-only event log.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage name (if applicable)
    pub stage_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{stage}:{payload_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Current status of the stage/run
    pub status: StageStatus,

    /// Workflow name (set on run_started)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,

    /// Position of the stage in the workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,

    /// Attempt number (1-indexed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Payload carried forward (run input on run_started, stage output on stage_completed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,

    /// Typed failure reported by the stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,

    /// When a scheduled retry becomes due
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,

    /// Time taken in milliseconds (for finished attempts)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage_id: Option<String>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: StageStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage_id,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            workflow: None,
            stage_index: None,
            attempt: None,
            payload: None,
            failure: None,
            wait_until: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Attach the workflow name
    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    /// Attach stage position and attempt number
    pub fn with_attempt(mut self, stage_index: usize, attempt: u32) -> Self {
        self.stage_index = Some(stage_index);
        self.attempt = Some(attempt);
        self
    }

    /// Attach a payload snapshot
    pub fn with_payload(mut self, payload: StagePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a stage failure; also fills `error` with its cause
    pub fn with_failure(mut self, failure: StageFailure) -> Self {
        self.error = Some(failure.cause.clone());
        self.failure = Some(failure);
        self
    }

    /// Attach a retry deadline
    pub fn with_wait_until(mut self, wait_until: DateTime<Utc>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// The final stage succeeded
    RunSucceeded,

    /// A stage failure reached the catch route
    RunFailed,

    /// The run was cancelled externally
    RunCancelled,

    /// A stage attempt has started
    StageStarted,

    /// A stage attempt succeeded
    StageCompleted,

    /// A stage attempt failed and another attempt is scheduled
    StageRetryScheduled,

    /// A stage failed for good (non-retryable or attempts exhausted)
    StageFailed,

    /// The failure was handed to the catch handler
    CatchInvoked,

    /// The terminal outcome was handed to the notification sink
    OutcomePublished,
}

impl EventType {
    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunSucceeded | Self::RunFailed | Self::RunCancelled
        )
    }
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing
    Running,

    /// Waiting for a scheduled retry
    Retrying,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Stopped by cancellation
    Cancelled,
}
