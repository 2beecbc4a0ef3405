//! Executor that delegates file generation to an external shell command.
//!
//! The command receives the attempt prompt on stdin and task metadata in
//! `WAVERUN_*` environment variables. Whatever it writes is picked up from
//! disk afterwards.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::orchestration::collaborators::{ExecutionRequest, Executor, ExecutorOutput};
use crate::{Error, Result};

/// Runs a configured shell command once per attempt.
pub struct CommandExecutor {
    command: String,
    project_root: PathBuf,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>, project_root: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            project_root: project_root.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn build_command(&self, request: &ExecutionRequest) -> Command {
        let task = &request.task;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_root)
            .env("WAVERUN_TASK_ID", task.id.as_str())
            .env("WAVERUN_TASK_NAME", &task.name)
            .env("WAVERUN_PRODUCES", task.produced_file().unwrap_or_default())
            .env("WAVERUN_INPUTS", task.input_files().join("\n"))
            .env("WAVERUN_VERIFY", &task.verify)
            .env("WAVERUN_ATTEMPT", request.attempt.to_string())
            .env("WAVERUN_PROJECT_ROOT", &self.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(hint) = &request.remediation {
            cmd.env("WAVERUN_REMEDIATION", hint);
        }
        cmd
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutorOutput> {
        debug!(task_id = %request.task.id, attempt = request.attempt, "spawning executor");
        let mut child = self.build_command(request).spawn()?;

        // Feed stdin while output is drained; the child may fill its stdout
        // pipe before reading the prompt.
        let stdin = child.stdin.take();
        let prompt = request.prompt();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // Commands that ignore stdin may exit before the prompt is written.
                match stdin.write_all(prompt.as_bytes()).await {
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(task_id = %request.task.id, %stdout, "executor output");

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "executor exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Executor(message));
        }

        let files_written = request
            .task
            .files()
            .filter(|f| self.project_root.join(f).exists())
            .map(String::from)
            .collect();

        Ok(ExecutorOutput {
            files_written,
            raw_output: stdout,
        })
    }
}
