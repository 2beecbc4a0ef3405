//! Boundary traits for the two external operations a task attempt needs.
//!
//! The engine never produces file contents or runs checks itself. It hands
//! an [`ExecutionRequest`] to an [`Executor`] and a verify command to a
//! [`Verifier`], both injected at construction time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::InputFile;
use crate::core::task::Task;
use crate::Result;

/// Everything an executor gets for one attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task: Arc<Task>,
    pub project_root: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Current contents of the task's input files.
    pub inputs: Vec<InputFile>,
    /// Directive derived from the previous attempt's classified failure.
    pub remediation: Option<String>,
    /// Raw error text of the previous attempt.
    pub previous_error: Option<String>,
}

impl ExecutionRequest {
    /// Instruction text for this attempt: the action, followed by the
    /// remediation directive on retries.
    pub fn prompt(&self) -> String {
        match (&self.remediation, &self.previous_error) {
            (Some(hint), Some(error)) => format!(
                "{}\n\nPrevious attempt failed:\n{}\n\n{}",
                self.task.action, error, hint
            ),
            (Some(hint), None) => format!("{}\n\n{}", self.task.action, hint),
            _ => self.task.action.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorOutput {
    pub files_written: Vec<String>,
    pub raw_output: String,
}

/// Result of running a verify command to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VerifyOutput {
    pub fn passed() -> Self {
        Self {
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stderr and stdout joined, for classification and reporting.
    pub fn combined(&self) -> String {
        match (self.stderr.trim(), self.stdout.trim()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{}\n{}", err, out),
        }
    }
}

/// Produces a task's files.
#[async_trait]
pub trait Executor: Send + Sync {
    /// An `Err` counts as a failed attempt and is classified like a
    /// verification failure.
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutorOutput>;
}

/// Runs a task's verify command.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Implementations must reject denylisted commands with
    /// `Error::ForbiddenVerifyCommand` without running them, and report an
    /// expired timeout as `Error::VerificationTimeout`.
    async fn verify(&self, command: &str, timeout: Duration) -> Result<VerifyOutput>;
}
