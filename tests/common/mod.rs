//! Shared fixtures for executor integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use trainflow::core::{CatchHandler, CaughtFailure, EventStore};
use trainflow::{
    EventType, ExecutorSettings, OutcomeMessage, NotificationSink, StageDefinition, StageFailure,
    StageInvoker, StagePayload, StageResult, Workflow, WorkflowDefinition, WorkflowExecutor,
};

/// One scripted response of a stage
pub enum Step {
    /// Return this payload
    Ok(StagePayload),
    /// Return this failure
    Fail(StageFailure),
    /// Never answer within any reasonable timeout
    Hang,
}

/// Invoker replaying a fixed script, then tagging the payload with its name
pub struct ScriptedInvoker {
    name: String,
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
    received: Mutex<Vec<StagePayload>>,
}

impl ScriptedInvoker {
    pub fn new(name: &str, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            received: Mutex::new(Vec::new()),
        })
    }

    /// Always succeeds
    pub fn ok(name: &str) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<StagePayload> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, payload: &StagePayload) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(payload.clone());

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Ok(payload)) => Ok(payload),
            Some(Step::Fail(failure)) => Err(failure),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(StageFailure::permanent("woke up from hang"))
            }
            None => {
                let mut next = payload.clone();
                next[self.name.as_str()] = json!("done");
                Ok(next)
            }
        }
    }
}

/// Sink keeping every published message
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<OutcomeMessage>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<OutcomeMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, message: &OutcomeMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Catch handler keeping every failure it receives
#[derive(Default)]
pub struct RecordingCatch {
    caught: Mutex<Vec<CaughtFailure>>,
    fail: bool,
}

impl RecordingCatch {
    pub fn failing() -> Self {
        Self {
            caught: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn caught(&self) -> Vec<CaughtFailure> {
        self.caught.lock().unwrap().clone()
    }
}

#[async_trait]
impl CatchHandler for RecordingCatch {
    async fn catch(&self, failure: &CaughtFailure) -> Result<()> {
        self.caught.lock().unwrap().push(failure.clone());
        if self.fail {
            anyhow::bail!("failure queue unavailable");
        }
        Ok(())
    }
}

/// Executor plus the collaborators a test inspects
pub struct Harness {
    pub executor: WorkflowExecutor,
    pub sink: Arc<RecordingSink>,
    pub catch: Arc<RecordingCatch>,
}

pub fn harness(
    runs_dir: &Path,
    stages: Vec<(StageDefinition, Arc<ScriptedInvoker>)>,
) -> Harness {
    harness_with(
        stages,
        Arc::new(RecordingCatch::default()),
        ExecutorSettings::new(runs_dir.to_path_buf()),
    )
}

pub fn harness_with(
    stages: Vec<(StageDefinition, Arc<ScriptedInvoker>)>,
    catch: Arc<RecordingCatch>,
    settings: ExecutorSettings,
) -> Harness {
    let sink = Arc::new(RecordingSink::default());
    let executor = WorkflowExecutor::new(
        workflow(stages),
        sink.clone(),
        catch.clone(),
        settings,
    );

    Harness {
        executor,
        sink,
        catch,
    }
}

pub fn workflow(stages: Vec<(StageDefinition, Arc<ScriptedInvoker>)>) -> Workflow {
    let mut invokers: HashMap<String, Arc<dyn StageInvoker>> = HashMap::new();
    let mut definitions = Vec::new();
    for (definition, invoker) in stages {
        invokers.insert(definition.name.clone(), invoker);
        definitions.push(definition);
    }

    Workflow::with_invokers(WorkflowDefinition::new("training", definitions), invokers).unwrap()
}

/// Count the events of one type in a run's log
pub async fn count_events(runs_dir: &Path, run_id: uuid::Uuid, event_type: EventType) -> usize {
    let store = EventStore::open_in(runs_dir, run_id).await.unwrap();
    store
        .replay()
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}
