//! Workflow executor.
//!
//! Drives one run through the workflow's stages: invoke, apply the stage's
//! retry policy, route exhausted failures to the catch handler, and publish the
//! terminal outcome exactly once. Every transition is appended to the run's
//! event log before the executor acts on it, so a run can be resumed by a
//! different process after any crash or suspension.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Event, EventType, OutcomeMessage, Run, RunState, StageFailure, StagePayload, StageStatus,
};
use crate::notify::NotificationSink;

use super::catch::{CatchHandler, CaughtFailure};
use super::event_store::{generate_idempotency_key, EventStore};
use super::retry::RetryDecision;
use super::runs;
use super::workflow::{BoundStage, Workflow};

/// Longest retry deadline ever persisted (about a thousand years)
const MAX_PERSISTED_WAIT_DAYS: i64 = 365_000;

/// Executor tuning that is not part of the workflow definition
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Directory holding one subdirectory per run
    pub runs_dir: PathBuf,

    /// Retry waits longer than this suspend the run instead of sleeping
    pub max_inline_wait: Duration,
}

impl ExecutorSettings {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self {
            runs_dir,
            max_inline_wait: Duration::from_secs(300),
        }
    }

    pub fn with_max_inline_wait(mut self, max_inline_wait: Duration) -> Self {
        self.max_inline_wait = max_inline_wait;
        self
    }

    /// Settings from the resolved configuration
    pub fn from_config() -> Result<Self> {
        let config = crate::config::config()?;
        Ok(Self::new(config.home.join("runs"))
            .with_max_inline_wait(Duration::from_secs(config.executor.max_inline_wait_seconds)))
    }
}

/// In-process cancellation signal for a run
///
/// Cancelling interrupts an inline retry wait immediately. A stage attempt
/// already in flight is allowed to finish, but its result is discarded and no
/// further attempt is scheduled.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Main workflow executor
pub struct WorkflowExecutor {
    workflow: Workflow,
    sink: Arc<dyn NotificationSink>,
    catch: Arc<dyn CatchHandler>,
    settings: ExecutorSettings,
}

impl WorkflowExecutor {
    /// Create an executor; all collaborators are fixed for its lifetime
    pub fn new(
        workflow: Workflow,
        sink: Arc<dyn NotificationSink>,
        catch: Arc<dyn CatchHandler>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            workflow,
            sink,
            catch,
            settings,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Start a new run with the given input
    #[instrument(skip(self, input, cancel), fields(workflow = %self.workflow.name()))]
    pub async fn start(&self, input: StagePayload, cancel: &CancelHandle) -> Result<Run> {
        let run_id = Uuid::new_v4();
        info!(%run_id, "Starting workflow run");

        let store = EventStore::open_in(&self.settings.runs_dir, run_id).await?;
        let _lease = store.try_lease()?;

        let mut run = Run::new(run_id, self.workflow.name().to_string(), input.clone());

        let start_event = Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("{}:start", run_id),
            format!("Workflow '{}' started", self.workflow.name()),
            StageStatus::Running,
        )
        .with_workflow(self.workflow.name())
        .with_payload(input);
        store.append(&start_event).await?;
        run.apply_event(&start_event);

        self.drive(&store, &mut run, cancel).await
    }

    /// Continue a run from its persisted state
    ///
    /// Suspended runs pick up their pending retry; terminal runs only get their
    /// outcome published if that never happened.
    #[instrument(skip(self, run_id, cancel), fields(run_id = %run_id, workflow = %self.workflow.name()))]
    pub async fn resume(&self, run_id: Uuid, cancel: &CancelHandle) -> Result<Run> {
        if !self.settings.runs_dir.join(run_id.to_string()).exists() {
            anyhow::bail!("Run not found: {}", run_id);
        }

        let store = EventStore::open_in(&self.settings.runs_dir, run_id).await?;
        let _lease = store.try_lease()?;

        let events = store.replay().await?;
        let mut run = Run::from_events(&events)
            .with_context(|| format!("No events found for run {}", run_id))?;

        if run.workflow_name != self.workflow.name() {
            anyhow::bail!(
                "Run {} belongs to workflow '{}', not '{}'",
                run_id,
                run.workflow_name,
                self.workflow.name()
            );
        }

        info!(
            stage_index = run.stage_index,
            attempt = run.attempt,
            state = run.state.label(),
            "Resuming run"
        );
        self.drive(&store, &mut run, cancel).await
    }

    /// Record a cancellation for a run driven elsewhere
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run> {
        runs::request_cancel(&self.settings.runs_dir, run_id).await
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<Run> {
        runs::load_run(&self.settings.runs_dir, run_id).await
    }

    /// Recent runs of this executor's workflow, newest first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let mut listed = runs::list_runs(&self.settings.runs_dir, usize::MAX).await?;
        listed.retain(|run| run.workflow_name == self.workflow.name());
        listed.truncate(limit);
        Ok(listed)
    }

    /// Advance the run until it terminates or suspends
    async fn drive(&self, store: &EventStore, run: &mut Run, cancel: &CancelHandle) -> Result<Run> {
        loop {
            if run.is_finished() {
                self.publish_outcome(store, run).await?;
                return Ok(run.clone());
            }

            if cancel_requested(store, cancel).await? {
                self.record_cancellation(store, run).await?;
                continue;
            }

            if let RunState::Retrying { wait_until } = run.state {
                let remaining = (wait_until - Utc::now()).to_std().unwrap_or(Duration::ZERO);

                if remaining > self.settings.max_inline_wait {
                    info!(
                        run_id = %run.id,
                        %wait_until,
                        attempt = run.attempt,
                        "Suspending run until retry is due"
                    );
                    return Ok(run.clone());
                }

                if !remaining.is_zero() {
                    debug!(
                        run_id = %run.id,
                        wait_ms = remaining.as_millis() as u64,
                        "Waiting for retry"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = cancel.cancelled() => {}
                    }
                }

                // Cancellation is re-checked at the top of the loop
                run.state = RunState::Running;
                continue;
            }

            let Some(stage) = self.workflow.stage(run.stage_index) else {
                // Every stage completed but the success event was never written
                self.succeed(store, run).await?;
                continue;
            };

            self.attempt_stage(store, run, stage, cancel).await?;
        }
    }

    /// Run one attempt of the current stage and record what follows from it
    async fn attempt_stage(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage: &BoundStage,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let stage_name = stage.name().to_string();
        let stage_index = run.stage_index;
        let attempt = run.attempt;
        let idem_key = generate_idempotency_key(run.id, &stage_name, &run.payload.to_string());

        let start_event = Event::new(
            run.id,
            Some(stage_name.clone()),
            EventType::StageStarted,
            format!("{}:{}", idem_key, attempt),
            format!("Stage '{}' attempt {}", stage_name, attempt),
            StageStatus::Running,
        )
        .with_attempt(stage_index, attempt);
        store.append(&start_event).await?;
        run.apply_event(&start_event);

        debug!(run_id = %run.id, stage = %stage_name, attempt, "Invoking stage");
        let step_start = Instant::now();

        let invocation = stage.invoker.invoke(&run.payload);
        let result = match tokio::time::timeout(stage.timeout, invocation).await {
            Ok(result) => result,
            Err(_) => Err(StageFailure::timeout(format!(
                "Stage '{}' timed out after {:?}",
                stage_name, stage.timeout
            ))),
        };

        let duration_ms = step_start.elapsed().as_millis() as u64;

        if cancel_requested(store, cancel).await? {
            info!(
                run_id = %run.id,
                stage = %stage_name,
                attempt,
                "Cancelled during attempt, result discarded"
            );
            return self.record_cancellation(store, run).await;
        }

        match result {
            Ok(payload) => {
                let complete_event = Event::new(
                    run.id,
                    Some(stage_name.clone()),
                    EventType::StageCompleted,
                    idem_key,
                    format!("Stage '{}' completed in {}ms", stage_name, duration_ms),
                    StageStatus::Completed,
                )
                .with_attempt(stage_index, attempt)
                .with_payload(payload)
                .with_duration(duration_ms);
                store.append(&complete_event).await?;
                run.apply_event(&complete_event);

                info!(
                    run_id = %run.id,
                    stage = %stage_name,
                    attempt,
                    duration_ms,
                    "Stage completed"
                );

                if run.stage_index >= self.workflow.len() {
                    self.succeed(store, run).await?;
                }
                Ok(())
            }
            Err(failure) => {
                self.handle_failure(store, run, stage, failure, duration_ms)
                    .await
            }
        }
    }

    /// Apply the stage's retry policy, or send the failure down the catch route
    async fn handle_failure(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage: &BoundStage,
        failure: StageFailure,
        duration_ms: u64,
    ) -> Result<()> {
        let stage_name = stage.name().to_string();
        let attempt = run.attempt;
        let key_prefix = format!("{}:{}", run.id, stage_name);

        match stage.retry().decide(failure.kind, attempt) {
            RetryDecision::Retry(delay) => {
                let wait_until = retry_deadline(Utc::now(), delay);

                let retry_event = Event::new(
                    run.id,
                    Some(stage_name.clone()),
                    EventType::StageRetryScheduled,
                    format!("{}:retry:{}", key_prefix, attempt),
                    format!(
                        "Stage '{}' failed, retrying in {:?}: {}",
                        stage_name, delay, failure
                    ),
                    StageStatus::Retrying,
                )
                .with_attempt(run.stage_index, attempt)
                .with_wait_until(wait_until)
                .with_duration(duration_ms)
                .with_failure(failure.clone());
                store.append(&retry_event).await?;
                run.apply_event(&retry_event);

                warn!(
                    run_id = %run.id,
                    stage = %stage_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    kind = %failure.kind,
                    error = %failure.cause,
                    "Stage failed, retrying"
                );
                Ok(())
            }
            RetryDecision::Exhausted => {
                let fail_event = Event::new(
                    run.id,
                    Some(stage_name.clone()),
                    EventType::StageFailed,
                    format!("{}:failed", key_prefix),
                    format!(
                        "Stage '{}' failed after {} attempts: {}",
                        stage_name, attempt, failure
                    ),
                    StageStatus::Failed,
                )
                .with_attempt(run.stage_index, attempt)
                .with_duration(duration_ms)
                .with_failure(failure.clone());
                store.append(&fail_event).await?;
                run.apply_event(&fail_event);

                error!(
                    run_id = %run.id,
                    stage = %stage_name,
                    attempt,
                    kind = %failure.kind,
                    error = %failure.cause,
                    "Stage failed permanently"
                );

                self.route_to_catch(store, run, stage, failure).await
            }
        }
    }

    /// Hand the failure to the shared catch handler and end the run
    async fn route_to_catch(
        &self,
        store: &EventStore,
        run: &mut Run,
        stage: &BoundStage,
        failure: StageFailure,
    ) -> Result<()> {
        let caught = CaughtFailure {
            run_id: run.id,
            workflow: run.workflow_name.clone(),
            target: stage.definition.catch.clone(),
            stage: stage.name().to_string(),
            attempt: run.attempt,
            failure,
        };

        // Logged before the handler runs; from here on a cancel is refused
        let catch_event = Event::new(
            run.id,
            Some(caught.stage.clone()),
            EventType::CatchInvoked,
            format!("{}:catch", run.id),
            format!("Failure routed to '{}'", caught.target),
            StageStatus::Failed,
        );
        if !store
            .append_unless(&catch_event, &[EventType::RunCancelled])
            .await?
        {
            return self.record_cancellation(store, run).await;
        }
        run.apply_event(&catch_event);

        let cause = caught.cause().to_string();
        let mut message = format!("Run failed: {}", cause);
        if let Err(e) = self.catch.catch(&caught).await {
            // The run still ends in Failure; the handler error is only recorded
            warn!(run_id = %run.id, error = %e, "Catch handler failed");
            message = format!("{} (catch handler error: {})", message, e);
        }

        let event = Event::new(
            run.id,
            None,
            EventType::RunFailed,
            format!("{}:complete", run.id),
            message,
            StageStatus::Failed,
        )
        .with_error(cause);
        store.append(&event).await?;
        run.apply_event(&event);

        Ok(())
    }

    /// Complete a successful run
    async fn succeed(&self, store: &EventStore, run: &mut Run) -> Result<()> {
        let event = Event::new(
            run.id,
            None,
            EventType::RunSucceeded,
            format!("{}:complete", run.id),
            format!("Workflow '{}' succeeded", run.workflow_name),
            StageStatus::Completed,
        )
        .with_payload(run.payload.clone());
        if !store.append_unless(&event, &[EventType::RunCancelled]).await? {
            return self.record_cancellation(store, run).await;
        }
        run.apply_event(&event);

        info!(run_id = %run.id, "Run completed successfully");
        Ok(())
    }

    /// Mark the run cancelled, reusing a cancellation already in the log
    async fn record_cancellation(&self, store: &EventStore, run: &mut Run) -> Result<()> {
        let event = match store.last_event_of_type(EventType::RunCancelled).await? {
            Some(existing) => existing,
            None => {
                let event = runs::cancellation_event(run);
                store.append(&event).await?;
                event
            }
        };
        run.apply_event(&event);

        info!(run_id = %run.id, stage_index = run.stage_index, "Run cancelled");
        Ok(())
    }

    /// Hand the terminal outcome to the sink, once per run
    async fn publish_outcome(&self, store: &EventStore, run: &mut Run) -> Result<()> {
        if run.outcome_published {
            return Ok(());
        }
        let Some(outcome) = run.outcome() else {
            // Cancelled runs have nothing to report
            return Ok(());
        };

        let message = OutcomeMessage::new(run.id, run.workflow_name.clone(), outcome);
        let mut event = Event::new(
            run.id,
            None,
            EventType::OutcomePublished,
            format!("{}:outcome", run.id),
            format!("Outcome published ({})", run.state.label()),
            StageStatus::Completed,
        );

        // Publishing is attempted once; a failed hand-off is recorded, not retried
        if let Err(e) = self.sink.publish(&message).await {
            warn!(run_id = %run.id, error = %e, "Outcome publish failed");
            event = event.with_error(e.to_string());
        }

        store.append(&event).await?;
        run.apply_event(&event);
        Ok(())
    }
}

/// Whether either cancellation path has fired
async fn cancel_requested(store: &EventStore, cancel: &CancelHandle) -> Result<bool> {
    Ok(cancel.is_cancelled() || store.is_cancelled().await?)
}

/// Wall-clock time at which a retry scheduled now becomes due
fn retry_deadline(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let cap = chrono::Duration::days(MAX_PERSISTED_WAIT_DAYS);
    let delay = chrono::Duration::from_std(delay)
        .ok()
        .filter(|d| *d < cap)
        .unwrap_or(cap);
    now + delay
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StageInvoker;
    use crate::core::catch::LogCatchHandler;
    use crate::core::retry::RetrySpec;
    use crate::core::workflow::{StageDefinition, WorkflowDefinition};
    use crate::domain::{ExecutionOutcome, StageResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Invoker that adds its name to the payload's `stages` list
    struct Appending(&'static str);

    #[async_trait]
    impl StageInvoker for Appending {
        fn name(&self) -> &str {
            self.0
        }

        async fn invoke(&self, payload: &StagePayload) -> StageResult {
            let mut payload = payload.clone();
            let mut stages = payload["stages"].as_array().cloned().unwrap_or_default();
            stages.push(json!(self.0));
            payload["stages"] = json!(stages);
            Ok(payload)
        }
    }

    struct AlwaysTransient;

    #[async_trait]
    impl StageInvoker for AlwaysTransient {
        fn name(&self) -> &str {
            "always-transient"
        }

        async fn invoke(&self, _payload: &StagePayload) -> StageResult {
            Err(StageFailure::transient("the training job is not completed"))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<OutcomeMessage>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, message: &OutcomeMessage) -> Result<()> {
            self.messages.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn executor(
        stages: Vec<(StageDefinition, Arc<dyn StageInvoker>)>,
        runs_dir: &TempDir,
        sink: Arc<RecordingSink>,
    ) -> WorkflowExecutor {
        let mut invokers = HashMap::new();
        let mut definitions = Vec::new();
        for (definition, invoker) in stages {
            invokers.insert(definition.name.clone(), invoker);
            definitions.push(definition);
        }
        let workflow =
            Workflow::with_invokers(WorkflowDefinition::new("training", definitions), invokers)
                .unwrap();

        WorkflowExecutor::new(
            workflow,
            sink,
            Arc::new(LogCatchHandler),
            ExecutorSettings::new(runs_dir.path().to_path_buf()),
        )
    }

    #[tokio::test]
    async fn test_payload_flows_through_stages() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let executor = executor(
            vec![
                (StageDefinition::new("dataset"), Arc::new(Appending("dataset"))),
                (StageDefinition::new("train"), Arc::new(Appending("train"))),
            ],
            &temp,
            sink.clone(),
        );

        let run = executor
            .start(json!({"key": "card.xls"}), &CancelHandle::new())
            .await
            .unwrap();

        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(
            run.payload,
            json!({"key": "card.xls", "stages": ["dataset", "train"]})
        );
        assert_eq!(sink.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_long_wait_suspends_and_persists() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let executor = executor(
            vec![(
                StageDefinition::new("train").with_retry(RetrySpec::poll(600_000, 1.1, 1000)),
                Arc::new(AlwaysTransient),
            )],
            &temp,
            sink.clone(),
        );

        let run = executor.start(json!({}), &CancelHandle::new()).await.unwrap();

        assert!(matches!(run.state, RunState::Retrying { .. }));
        assert_eq!(run.attempt, 2);
        assert!(sink.messages.lock().unwrap().is_empty());

        let persisted = executor.get_run_status(run.id).await.unwrap();
        assert_eq!(persisted.state, run.state);
        assert_eq!(persisted.attempt, 2);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_every_stage() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let executor = executor(
            vec![(StageDefinition::new("dataset"), Arc::new(Appending("dataset")))],
            &temp,
            sink.clone(),
        );

        let cancel = CancelHandle::new();
        cancel.cancel();
        let run = executor.start(json!({}), &cancel).await.unwrap();

        assert_eq!(run.state, RunState::Cancelled);
        assert_eq!(run.attempts_for("dataset"), 0);
        assert!(sink.messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_deadline_is_capped() {
        let now = Utc::now();
        assert_eq!(
            retry_deadline(now, Duration::from_secs(30)),
            now + chrono::Duration::seconds(30)
        );

        let far = retry_deadline(now, Duration::from_millis(u64::MAX));
        assert_eq!(far, now + chrono::Duration::days(MAX_PERSISTED_WAIT_DAYS));
    }

    #[tokio::test]
    async fn test_cancel_handle_wakes_waiters() {
        let cancel = CancelHandle::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        cancel.cancel();
        task.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_outcome_for_succeeded_run() {
        let mut run = Run::new(Uuid::new_v4(), "training".to_string(), json!({"a": 1}));
        run.state = RunState::Succeeded;
        assert_eq!(
            run.outcome(),
            Some(ExecutionOutcome::Success {
                payload: json!({"a": 1})
            })
        );
    }
}
