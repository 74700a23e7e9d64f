//! Subprocess stage invoker.
//!
//! Spawns the configured program, pipes the payload to stdin as JSON and reads
//! the next payload from stdout. Exit code 75 (`EX_TEMPFAIL`) means "still in
//! progress, ask again later"; any other non-zero exit is a permanent failure.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::StageInvoker;
use crate::domain::{StageFailure, StagePayload, StageResult};

/// Exit code a stage program uses to report work still in progress
pub const EXIT_IN_PROGRESS: i32 = 75;

/// Stage invoker backed by a local program
pub struct CommandInvoker {
    /// Program to run
    program: String,

    /// Arguments passed to the program
    args: Vec<String>,

    /// Extra environment variables
    env: HashMap<String, String>,
}

impl CommandInvoker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Map a finished process to a stage result
    fn interpret(
        &self,
        code: Option<i32>,
        stdout: &[u8],
        stderr: &[u8],
        payload: &StagePayload,
    ) -> StageResult {
        let stderr = String::from_utf8_lossy(stderr).trim().to_string();

        match code {
            Some(0) => {
                let stdout = String::from_utf8_lossy(stdout);
                if stdout.trim().is_empty() {
                    // Nothing printed: the stage passes its input through
                    return Ok(payload.clone());
                }
                serde_json::from_str(stdout.trim()).map_err(|e| {
                    StageFailure::permanent(format!(
                        "'{}' printed invalid JSON: {}",
                        self.program, e
                    ))
                })
            }
            Some(EXIT_IN_PROGRESS) => {
                let cause = if stderr.is_empty() {
                    format!("'{}' reported work in progress", self.program)
                } else {
                    stderr
                };
                Err(StageFailure::transient(cause))
            }
            Some(code) => Err(StageFailure::permanent(if stderr.is_empty() {
                format!("'{}' failed with exit code {}", self.program, code)
            } else {
                stderr
            })),
            None => Err(StageFailure::permanent(format!(
                "'{}' was terminated by a signal",
                self.program
            ))),
        }
    }
}

#[async_trait]
impl StageInvoker for CommandInvoker {
    fn name(&self) -> &str {
        &self.program
    }

    async fn invoke(&self, payload: &StagePayload) -> StageResult {
        let input = serde_json::to_vec(payload).map_err(|e| {
            StageFailure::permanent(format!("Failed to encode payload: {}", e))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageFailure::permanent(format!("Failed to spawn '{}': {}", self.program, e))
            })?;

        // Feed stdin while stdout is drained, then drop it to signal EOF
        let stdin = child.stdin.take();
        let write_input = async move {
            match stdin {
                Some(mut stdin) => stdin.write_all(&input).await,
                None => Ok(()),
            }
        };

        let (written, output) = tokio::join!(write_input, child.wait_with_output());

        let output = output.map_err(|e| {
            StageFailure::permanent(format!("Failed to wait for '{}': {}", self.program, e))
        })?;

        // A program may exit without reading all of its input
        if let Err(e) = written {
            if e.kind() != ErrorKind::BrokenPipe {
                return Err(StageFailure::permanent(format!(
                    "Failed to write to '{}' stdin: {}",
                    self.program, e
                )));
            }
        }

        self.interpret(output.status.code(), &output.stdout, &output.stderr, payload)
    }
}
