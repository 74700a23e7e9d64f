//! Command-line interface for trainflow.
//!
//! Provides commands for starting workflow runs, checking status, listing
//! runs, resuming suspended runs, cancelling, and validating definitions.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::core::{
    runs, CancelHandle, ExecutorSettings, LogCatchHandler, Workflow, WorkflowDefinition,
    WorkflowExecutor,
};
use crate::domain::{Run, RunState, StagePayload};
use crate::notify::Topic;

/// trainflow - Durable training pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "trainflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a workflow run
    Run {
        /// Workflow name (looks for workflows/<name>.yaml) or path to a YAML file
        workflow: String,

        /// JSON input file (reads stdin when piped, else starts with `{}`)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Continue a suspended or interrupted run
    Resume {
        /// Run ID to resume
        run_id: String,
    },

    /// Cancel a run; takes effect before its next stage attempt
    Cancel {
        /// Run ID to cancel
        run_id: String,
    },

    /// Resume every run whose retry is due
    Tick,

    /// Check a workflow definition without running it
    Validate {
        /// Workflow name or path to a YAML file
        workflow: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { workflow, input } => start_run(&workflow, input).await,
            Commands::Status { run_id } => show_status(&run_id).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Resume { run_id } => resume_run(&run_id).await,
            Commands::Cancel { run_id } => cancel_run(&run_id).await,
            Commands::Tick => tick().await,
            Commands::Validate { workflow } => validate(&workflow),
            Commands::Config => show_config(),
        }
    }
}

/// Start a new run of a workflow
async fn start_run(workflow_name: &str, input_file: Option<PathBuf>) -> Result<()> {
    let (executor, topic) = build_executor(workflow_name)?;
    let input = read_input(input_file)?;

    let cancel = cancel_on_ctrl_c();
    let run = executor.start(input, &cancel).await?;
    topic.drain().await;

    report(&run, "started")
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let run = runs::load_run(&config::runs_dir()?, run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Workflow: {}", run.workflow_name);
    println!("State: {}", run.state.label());
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    match &run.state {
        RunState::Retrying { wait_until } => println!("Next attempt: {}", wait_until),
        RunState::Failed { cause } => println!("Cause: {}", cause),
        _ => {}
    }
    println!("Current stage: {} (attempt {})", run.stage_index, run.attempt);
    if let Some(ref failure) = run.last_failure {
        println!("Last failure: {}", failure);
    }
    println!("Outcome published: {}", run.outcome_published);
    println!("\nStage statuses:");
    for (stage, status) in &run.stage_statuses {
        println!(
            "  {}: {:?} ({} attempts)",
            stage,
            status,
            run.attempts_for(stage)
        );
    }
    println!("\nPayload:\n{}", serde_json::to_string_pretty(&run.payload)?);

    Ok(())
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs = runs::list_runs(&config::runs_dir()?, limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {:<8}", "RUN ID", "WORKFLOW", "STATE", "STAGE");
    println!("{}", "-".repeat(78));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<10} {}/{}",
            run.id,
            run.workflow_name,
            run.state.label(),
            run.stage_index,
            run.attempt
        );
    }

    Ok(())
}

/// Resume a run with the workflow it was started with
async fn resume_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let existing = runs::load_run(&config::runs_dir()?, run_id).await?;

    let (executor, topic) = build_executor(&existing.workflow_name)?;
    let cancel = cancel_on_ctrl_c();
    let run = executor.resume(run_id, &cancel).await?;
    topic.drain().await;

    report(&run, "resumed")
}

/// Record a cancellation for a run
async fn cancel_run(run_id_str: &str) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let run = runs::request_cancel(&config::runs_dir()?, run_id).await?;

    match run.state {
        RunState::Cancelled => eprintln!("[Run {} cancelled]", run.id),
        ref state => eprintln!("[Run {} not cancelled: {}]", run.id, state.label()),
    }

    Ok(())
}

/// Resume every due run once
async fn tick() -> Result<()> {
    let runs_dir = config::runs_dir()?;
    let due = runs::due_runs(&runs_dir, Utc::now()).await?;

    if due.is_empty() {
        info!("No runs due");
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    for run in due {
        if cancel.is_cancelled() {
            break;
        }

        let result = match build_executor(&run.workflow_name) {
            Ok((executor, topic)) => {
                let resumed = executor.resume(run.id, &cancel).await;
                topic.drain().await;
                resumed
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(run) => eprintln!("[Run {} {}]", run.id, run.state.label()),
            // A run held by another executor is skipped until the next tick
            Err(e) => warn!(run_id = %run.id, error = %e, "Failed to resume run"),
        }
    }

    Ok(())
}

/// Load and bind a workflow without running it
fn validate(workflow_name: &str) -> Result<()> {
    let workflow = load_workflow(workflow_name)?;

    println!("Workflow '{}' is valid", workflow.name());
    for stage in workflow.stages() {
        let retry = stage.retry();
        println!(
            "  {}: timeout {:?}, max_attempts {}, interval {}ms, backoff {}",
            stage.name(),
            stage.timeout,
            retry.max_attempts,
            retry.interval_ms,
            retry.backoff_rate
        );
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    let config_file = cfg
        .config_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none - using defaults)".to_string());

    println!("Config file: {}", config_file);
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Runs:      {}", cfg.home.join("runs").display());
    println!("  Workflows: {}", cfg.workflows.display());
    println!();
    println!("Executor:");
    println!("  Max inline wait: {}s", cfg.executor.max_inline_wait_seconds);
    println!();
    println!("Notifications:");
    println!("  Webhook:  {}", configured(cfg.notify.webhook_url.is_some()));
    println!("  Telegram: {}", configured(cfg.notify.telegram.is_some()));

    Ok(())
}

fn configured(present: bool) -> &'static str {
    if present {
        "configured"
    } else {
        "(none)"
    }
}

/// Build an executor for a workflow from the resolved configuration
///
/// The topic is returned alongside so callers can drain deliveries before
/// the process exits.
fn build_executor(workflow_name: &str) -> Result<(WorkflowExecutor, Arc<Topic>)> {
    let workflow = load_workflow(workflow_name)?;
    let topic = Arc::new(config::config()?.notify.topic("outcomes"));

    let executor = WorkflowExecutor::new(
        workflow,
        topic.clone(),
        Arc::new(LogCatchHandler),
        ExecutorSettings::from_config()?,
    );
    Ok((executor, topic))
}

/// Load a workflow by name or path
fn load_workflow(name: &str) -> Result<Workflow> {
    let workflow_path = config::workflows_dir()?.join(format!("{}.yaml", name));

    let path = if workflow_path.exists() {
        workflow_path
    } else {
        let alt_path = PathBuf::from(name);
        if !alt_path.is_file() {
            anyhow::bail!(
                "Workflow '{}' not found. Looked for:\n  - {}\n  - {}",
                name,
                workflow_path.display(),
                alt_path.display()
            );
        }
        alt_path
    };

    let definition = WorkflowDefinition::from_file(&path)?;
    Workflow::build(definition)
        .with_context(|| format!("Invalid workflow: {}", path.display()))
}

/// Read the run input as JSON
fn read_input(input_file: Option<PathBuf>) -> Result<StagePayload> {
    let content = if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        String::new()
    };

    if content.trim().is_empty() {
        return Ok(StagePayload::Object(Default::default()));
    }

    serde_json::from_str(&content).context("Input is not valid JSON")
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

/// Cancel handle tripped by Ctrl-C
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            handle.cancel();
        }
    });
    cancel
}

/// Print the run result and exit non-zero on failure
fn report(run: &Run, verb: &str) -> Result<()> {
    match &run.state {
        RunState::Succeeded => {
            println!("{}", serde_json::to_string_pretty(&run.payload)?);
            eprintln!("\n[Run {} {} and succeeded]", run.id, verb);
        }
        RunState::Failed { cause } => {
            eprintln!("\n[Run {} failed: {}]", run.id, cause);
            std::process::exit(1);
        }
        RunState::Retrying { wait_until } => {
            eprintln!(
                "\n[Run {} suspended; attempt {} due at {}. Continue with `trainflow resume {}` or `trainflow tick`]",
                run.id, run.attempt, wait_until, run.id
            );
        }
        RunState::Cancelled => {
            eprintln!("\n[Run {} cancelled]", run.id);
            std::process::exit(130);
        }
        RunState::Running => {
            eprintln!("\n[Run {} in state: {}]", run.id, run.state.label());
        }
    }

    Ok(())
}
