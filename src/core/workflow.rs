//! Workflow definitions and loading.
//!
//! Workflows are defined in YAML and consist of ordered stages, each with its
//! own invoker, retry policy, catch target and per-attempt timeout. A
//! definition is validated and bound to invokers once, producing an immutable
//! [`Workflow`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::RetrySpec;
use crate::adapters::{invoker_from_spec, InvokerSpec, StageInvoker};

/// Malformed workflow configuration; fatal at construction time
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Workflow name cannot be empty")]
    EmptyName,

    #[error("Workflow must have at least one stage")]
    NoStages,

    #[error("Stage {index} has an empty name")]
    EmptyStageName { index: usize },

    #[error("Stage '{stage}' is defined more than once")]
    DuplicateStage { stage: String },

    #[error("Stage '{stage}': max_attempts must be at least 1 (got {max_attempts})")]
    MaxAttempts { stage: String, max_attempts: u32 },

    #[error("Stage '{stage}': backoff_rate must be a finite number >= 1.0 (got {backoff_rate})")]
    BackoffRate { stage: String, backoff_rate: f64 },

    #[error("Stage '{stage}': catch target '{target}' is not the workflow failure state '{expected}'")]
    UnknownCatchTarget {
        stage: String,
        target: String,
        expected: String,
    },

    #[error("Stage '{stage}': timeout must be a positive number of seconds (got {seconds})")]
    InvalidTimeout { stage: String, seconds: f64 },

    #[error("Stage '{stage}' has no invoker")]
    MissingInvoker { stage: String },

    #[error("Invoker bound to unknown stage '{stage}'")]
    UnknownStage { stage: String },
}

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name (used in CLI, logs and notifications)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Name of the shared failure state every catch route points at
    #[serde(default = "default_failure_state")]
    pub failure_state: String,

    /// Per-attempt timeout for stages that don't set their own
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: f64,

    /// Ordered list of stages to execute
    pub stages: Vec<StageDefinition>,
}

/// A single stage in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage name (unique within workflow)
    pub name: String,

    /// How to call the stage; may be omitted when bound in code
    #[serde(default)]
    pub invoker: Option<InvokerSpec>,

    /// Retry policy for this stage (default: a single attempt)
    #[serde(default = "RetrySpec::none")]
    pub retry: RetrySpec,

    /// Where exhausted or non-retryable failures go
    #[serde(default = "default_failure_state")]
    pub catch: String,

    /// Override timeout for this stage
    pub timeout_seconds: Option<f64>,
}

fn default_failure_state() -> String {
    "Failure".to_string()
}
fn default_stage_timeout() -> f64 {
    300.0
} // 5 min

impl StageDefinition {
    /// A stage bound in code, with default retry and catch settings
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            invoker: None,
            retry: RetrySpec::none(),
            catch: default_failure_state(),
            timeout_seconds: None,
        }
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Get the effective timeout for this stage
    pub fn timeout(&self, default_seconds: f64) -> Result<Duration, ConfigError> {
        let seconds = self.timeout_seconds.unwrap_or(default_seconds);
        match Duration::try_from_secs_f64(seconds) {
            Ok(timeout) if !timeout.is_zero() => Ok(timeout),
            _ => Err(ConfigError::InvalidTimeout {
                stage: self.name.clone(),
                seconds,
            }),
        }
    }
}

impl WorkflowDefinition {
    /// A definition with default settings and the given stages
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            failure_state: default_failure_state(),
            stage_timeout_seconds: default_stage_timeout(),
            stages,
        }
    }

    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Validate the workflow definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }

        let mut seen = HashSet::new();
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return Err(ConfigError::EmptyStageName { index });
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }

            stage.retry.validate(&stage.name)?;
            stage.timeout(self.stage_timeout_seconds)?;

            if stage.catch != self.failure_state {
                return Err(ConfigError::UnknownCatchTarget {
                    stage: stage.name.clone(),
                    target: stage.catch.clone(),
                    expected: self.failure_state.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get the index of a stage by name
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }
}

/// A stage with its invoker and resolved timeout
#[derive(Clone)]
pub struct BoundStage {
    pub definition: StageDefinition,
    pub timeout: Duration,
    pub invoker: Arc<dyn StageInvoker>,
}

impl BoundStage {
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn retry(&self) -> &RetrySpec {
        &self.definition.retry
    }
}

/// A validated definition bound to its invokers; immutable once built
#[derive(Clone)]
pub struct Workflow {
    definition: WorkflowDefinition,
    stages: Vec<BoundStage>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.definition.name)
            .field("stages", &self.definition.stages.len())
            .finish()
    }
}

impl Workflow {
    /// Build from the invoker specs in the definition
    pub fn build(definition: WorkflowDefinition) -> Result<Self, ConfigError> {
        Self::with_invokers(definition, HashMap::new())
    }

    /// Build with explicit invokers, keyed by stage name
    ///
    /// Explicit bindings take precedence over the definition's invoker specs.
    pub fn with_invokers(
        definition: WorkflowDefinition,
        mut invokers: HashMap<String, Arc<dyn StageInvoker>>,
    ) -> Result<Self, ConfigError> {
        definition.validate()?;

        if let Some(stage) = invokers
            .keys()
            .find(|name| definition.stage_index(name).is_none())
        {
            return Err(ConfigError::UnknownStage {
                stage: stage.clone(),
            });
        }

        let mut stages = Vec::with_capacity(definition.stages.len());
        for stage in &definition.stages {
            let invoker = match invokers.remove(&stage.name) {
                Some(invoker) => invoker,
                None => match &stage.invoker {
                    Some(spec) => invoker_from_spec(spec),
                    None => {
                        return Err(ConfigError::MissingInvoker {
                            stage: stage.name.clone(),
                        })
                    }
                },
            };

            stages.push(BoundStage {
                definition: stage.clone(),
                timeout: stage.timeout(definition.stage_timeout_seconds)?,
                invoker,
            });
        }

        Ok(Self { definition, stages })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn stages(&self) -> &[BoundStage] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&BoundStage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
