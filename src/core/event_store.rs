//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per run under
//! `<runs_dir>/<run_id>/events.jsonl`. Appends take an exclusive file lock so
//! the executor and an external `cancel` can write to the same log.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, EventType};

/// File-based event store using JSONL format
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open an event store for a run under `base_dir`
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Take the exclusive right to drive this run
    ///
    /// Fails immediately if another executor (in this or another process)
    /// holds the lease. The lease is released when dropped.
    pub fn try_lease(&self) -> Result<RunLease> {
        let lock_path = self.run_dir.join("lease");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lease file: {}", lock_path.display()))?;

        FileExt::try_lock_exclusive(&file).with_context(|| {
            format!("Run is already being executed: {}", self.run_dir.display())
        })?;

        Ok(RunLease { _file: file })
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');

        let path = self.events_path.clone();
        tokio::task::spawn_blocking(move || append_locked(&path, line.as_bytes(), &[]))
            .await
            .context("Event append task failed")?
            .map(|_| ())
    }

    /// Append an event unless the log already holds one of `blocked_by`
    ///
    /// The check and the write happen under the same file lock, so of two
    /// writers racing to end a run exactly one wins. Returns whether the
    /// event was written.
    pub async fn append_unless(&self, event: &Event, blocked_by: &[EventType]) -> Result<bool> {
        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');

        let path = self.events_path.clone();
        let blocked_by = blocked_by.to_vec();
        tokio::task::spawn_blocking(move || append_locked(&path, line.as_bytes(), &blocked_by))
            .await
            .context("Event append task failed")?
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path).await.with_context(|| {
            format!("Failed to open events file: {}", self.events_path.display())
        })?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Whether a cancellation has been recorded for this run
    pub async fn is_cancelled(&self) -> Result<bool> {
        Ok(self
            .last_event_of_type(EventType::RunCancelled)
            .await?
            .is_some())
    }

    /// List all run IDs in the given base directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Exclusive right to drive a run; released on drop
#[derive(Debug)]
pub struct RunLease {
    _file: std::fs::File,
}

/// Append bytes to the events file under an exclusive lock
///
/// Nothing is written if the log already holds an event of a `blocked_by` type.
fn append_locked(events_path: &Path, bytes: &[u8], blocked_by: &[EventType]) -> Result<bool> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(events_path)
        .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

    FileExt::lock_exclusive(&file).context("Failed to acquire file lock on events.jsonl")?;

    if !blocked_by.is_empty() {
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read events file")?;

        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let event: Event = serde_json::from_str(line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            if blocked_by.contains(&event.event_type) {
                return Ok(false);
            }
        }
    }

    file.write_all(bytes).context("Failed to write event")?;
    file.sync_data().context("Failed to sync event")?;

    // Lock is released when file is dropped
    Ok(true)
}

/// Generate an idempotency key for a stage
pub fn generate_idempotency_key(run_id: Uuid, stage_name: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", run_id, stage_name, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
