//! Run queries and out-of-band control.
//!
//! These work directly on the runs directory and need no workflow binding, so
//! the CLI can inspect or cancel a run that another process is driving.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Event, EventType, Run, StageStatus};

use super::event_store::EventStore;

/// Rebuild a run from its event log
pub async fn load_run(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
    if !runs_dir.join(run_id.to_string()).exists() {
        anyhow::bail!("Run not found: {}", run_id);
    }

    let store = EventStore::open_in(runs_dir, run_id).await?;
    let events = store.replay().await?;

    Run::from_events(&events).with_context(|| format!("No events found for run {}", run_id))
}

/// Most recent runs first, at most `limit` of them
pub async fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<Run>> {
    let mut runs = Vec::new();
    for run_id in EventStore::list_runs_in(runs_dir).await? {
        let store = EventStore::open_in(runs_dir, run_id).await?;
        if let Some(run) = Run::from_events(&store.replay().await?) {
            runs.push(run);
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}

/// Runs a scheduler should resume at `now`
pub async fn due_runs(runs_dir: &Path, now: DateTime<Utc>) -> Result<Vec<Run>> {
    let mut due: Vec<Run> = list_runs(runs_dir, usize::MAX)
        .await?
        .into_iter()
        .filter(|run| run.is_due(now))
        .collect();

    due.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    Ok(due)
}

/// Events that settle how a run ends; once one is logged a cancel is refused
pub(crate) const SETTLING_EVENTS: [EventType; 4] = [
    EventType::CatchInvoked,
    EventType::RunSucceeded,
    EventType::RunFailed,
    EventType::RunCancelled,
];

/// Record a cancellation request in the run's log
///
/// The executor driving the run picks it up as soon as its current attempt
/// returns, or when the run is next resumed. Cancelling a run that has already
/// succeeded or reached its catch route changes nothing.
pub async fn request_cancel(runs_dir: &Path, run_id: Uuid) -> Result<Run> {
    let mut run = load_run(runs_dir, run_id).await?;
    if run.is_finished() {
        return Ok(run);
    }

    let store = EventStore::open_in(runs_dir, run_id).await?;
    let event = cancellation_event(&run);
    if !store.append_unless(&event, &SETTLING_EVENTS).await? {
        // The executor settled the run between the load and the append
        return load_run(runs_dir, run_id).await;
    }
    run.apply_event(&event);

    Ok(run)
}

/// The terminal event for a cancelled run
pub(crate) fn cancellation_event(run: &Run) -> Event {
    Event::new(
        run.id,
        None,
        EventType::RunCancelled,
        format!("{}:cancel", run.id),
        format!("Run cancelled at stage {}", run.stage_index),
        StageStatus::Cancelled,
    )
}
