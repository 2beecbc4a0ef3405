//! Per-task execution state machine.
//!
//! The coordinator drives one task from `Pending` to a terminal status:
//! cache check, then up to `max_retries + 1` attempts of execute + verify,
//! classifying every failure and feeding a remediation directive into the
//! next attempt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{
    read_input_bytes, read_output_bytes, restore_output, CacheLookup, CacheOutcome, CacheStore,
    InputFile,
};
use crate::core::task::{SkipReason, Task, TaskId, TaskStatus};
use crate::orchestration::classify::{classify, remediation_hint, FailureKind};
use crate::orchestration::collaborators::{ExecutionRequest, Executor, Verifier, VerifyOutput};
use crate::orchestration::engine::RunOptions;
use crate::orchestration::runner::RunEvent;
use crate::util::{blocking, truncate_tail};
use crate::{Error, Result};

/// Longest error excerpt kept on a record.
const MAX_ERROR_BYTES: usize = 4000;

/// A failure bucketed for remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: FailureKind,
    pub message: String,
    pub hint: String,
}

impl ClassifiedError {
    pub fn new(kind: FailureKind, message: &str) -> Self {
        Self {
            kind,
            message: truncate_tail(message.trim(), MAX_ERROR_BYTES).to_string(),
            hint: remediation_hint(kind).to_string(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::ForbiddenVerifyCommand { .. } => Self::new(FailureKind::Forbidden, &err.to_string()),
            Error::VerificationTimeout(_) | Error::Timeout(_) => {
                Self::new(FailureKind::Timeout, &err.to_string())
            }
            Error::Executor(message) => Self::new(classify(message), message),
            other => {
                let message = other.to_string();
                Self::new(classify(&message), &message)
            }
        }
    }

    pub fn from_verify(output: &VerifyOutput) -> Self {
        let combined = output.combined();
        let message = if combined.is_empty() {
            match output.exit_code {
                Some(code) => format!("verify command exited with code {}", code),
                None => "verify command terminated by signal".to_string(),
            }
        } else {
            combined
        };
        Self::new(classify(&message), &message)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Tracks one task's status and enforces valid transitions.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    task_id: TaskId,
    status: TaskStatus,
    history: Vec<StatusChange>,
}

impl ExecutionState {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            history: vec![StatusChange {
                status: TaskStatus::Pending,
                at: Utc::now(),
            }],
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    pub fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidStatusTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        debug!(task_id = %self.task_id, from = %self.status, to = %target, "status change");
        self.status = target;
        self.history.push(StatusChange {
            status: target,
            at: Utc::now(),
        });
        Ok(())
    }
}

/// Final record of one task in one run. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: Uuid,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub error: Option<ClassifiedError>,
    pub summary: String,
    #[serde(default)]
    pub files_written: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskExecution {
    /// Record for a task that never ran.
    pub fn skipped(task_id: TaskId, reason: SkipReason, summary: &str) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            task_id,
            status: TaskStatus::Skipped { reason },
            attempts: 0,
            retry_count: 0,
            duration_ms: 0,
            error: None,
            summary: summary.to_string(),
            files_written: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Drives a task through cache check, attempts and classification.
///
/// Collaborators and the cache are injected; nothing here is global.
pub struct ExecutionCoordinator {
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    cache: Option<Arc<CacheStore>>,
    project_root: PathBuf,
    options: RunOptions,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl ExecutionCoordinator {
    pub fn new(
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
        project_root: impl Into<PathBuf>,
        options: RunOptions,
    ) -> Self {
        Self {
            executor,
            verifier,
            cache: None,
            project_root: project_root.into(),
            options,
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn active_cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref().filter(|_| self.options.cache_enabled)
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn read_inputs(&self, task: &Arc<Task>) -> Option<Vec<InputFile>> {
        let root = self.project_root.clone();
        let task = Arc::clone(task);
        let task_id = task.id.clone();
        match blocking(move || read_input_bytes(&root, &task)).await {
            Ok(inputs) => Some(inputs),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "could not read inputs, cache disabled for task");
                None
            }
        }
    }

    /// A replayable hit's summary. The produced file is put back first; a
    /// hit whose output can't be restored counts as a miss.
    async fn cache_lookup(&self, task: &Arc<Task>, inputs: &[InputFile]) -> Option<String> {
        let cache = Arc::clone(self.active_cache()?);
        let root = self.project_root.clone();
        let task_id = task.id.clone();
        let task = Arc::clone(task);
        let inputs = inputs.to_vec();
        let replay = blocking(move || match cache.lookup(&task, &inputs) {
            CacheLookup::Hit(entry) if entry.outcome == CacheOutcome::Succeeded => {
                Ok(restore_output(&root, &task, &entry)?.then_some(entry.summary))
            }
            _ => Ok(None),
        })
        .await;
        match replay {
            Ok(Some(summary)) => Some(summary),
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "could not restore cached output, running task");
                None
            }
        }
    }

    async fn cache_store(&self, task: &Arc<Task>, inputs: &[InputFile], summary: &str) {
        let Some(cache) = self.active_cache().cloned() else {
            return;
        };
        let root = self.project_root.clone();
        let task = Arc::clone(task);
        let task_id = task.id.clone();
        let inputs = inputs.to_vec();
        let summary = summary.to_string();
        let stored = blocking(move || {
            let output = read_output_bytes(&root, &task)?;
            cache.store_with_output(&task, &inputs, CacheOutcome::Succeeded, &summary, output)
        })
        .await;
        if let Err(e) = stored {
            warn!(task_id = %task_id, error = %e, "failed to store cache entry");
        }
    }

    /// Run one task to a terminal status.
    ///
    /// Task failures are part of the returned record, not `Err`. An `Err`
    /// means the state machine itself was violated.
    ///
    /// Cancellation is only observed between attempts; an attempt in flight
    /// is allowed to finish.
    pub async fn run(&self, task: Arc<Task>, cancel: &CancellationToken) -> Result<TaskExecution> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut state = ExecutionState::new(task.id.clone());

        let inputs = self.read_inputs(&task).await;

        if let Some(inputs) = inputs.as_deref() {
            if !self.options.force {
                if let Some(summary) = self.cache_lookup(&task, inputs).await {
                    state.transition(TaskStatus::Skipped {
                        reason: SkipReason::Cached,
                    })?;
                    info!(task_id = %task.id, "replayed from cache");
                    return Ok(TaskExecution {
                        execution_id: Uuid::new_v4(),
                        task_id: task.id.clone(),
                        status: state.status(),
                        attempts: 0,
                        retry_count: 0,
                        duration_ms: clock.elapsed().as_millis() as u64,
                        error: None,
                        summary,
                        files_written: Vec::new(),
                        started_at,
                        finished_at: Utc::now(),
                    });
                }
            }
        }

        let total_attempts = self.options.max_retries.saturating_add(1);
        let input_files = inputs.clone().unwrap_or_default();
        let mut last_error: Option<ClassifiedError> = None;
        let mut attempts = 0;
        let mut files_written = Vec::new();
        let mut summary = String::new();

        while attempts < total_attempts {
            if attempts > 0 {
                if cancel.is_cancelled() {
                    debug!(task_id = %task.id, "stop requested, not retrying");
                    break;
                }
                let delay = self.options.backoff.delay(attempts);
                if let Some(error) = &last_error {
                    self.emit(RunEvent::TaskRetrying {
                        task_id: task.id.clone(),
                        attempt: attempts + 1,
                        kind: error.kind,
                        delay,
                    })
                    .await;
                }
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            debug!(task_id = %task.id, "stop requested during backoff");
                            break;
                        }
                    }
                }
            }

            attempts += 1;
            state.transition(TaskStatus::Running)?;
            debug!(task_id = %task.id, attempt = attempts, "attempt started");

            let request = ExecutionRequest {
                task: Arc::clone(&task),
                project_root: self.project_root.clone(),
                attempt: attempts,
                inputs: input_files.clone(),
                remediation: last_error.as_ref().map(|e| e.hint.clone()),
                previous_error: last_error.as_ref().map(|e| e.message.clone()),
            };

            let timeout = self.options.task_timeout;
            let failure = match tokio::time::timeout(timeout, self.executor.execute(&request)).await {
                Err(_) => ClassifiedError::from_error(&Error::Timeout(timeout)),
                Ok(Err(e)) => ClassifiedError::from_error(&e),
                Ok(Ok(output)) => {
                    state.transition(TaskStatus::Verifying)?;
                    match self
                        .verifier
                        .verify(&task.verify, self.options.verify_timeout)
                        .await
                    {
                        Ok(verified) if verified.success() => {
                            files_written = output.files_written;
                            summary = format!("verified on attempt {}", attempts);
                            state.transition(TaskStatus::Succeeded)?;
                            last_error = None;
                            break;
                        }
                        Ok(verified) => ClassifiedError::from_verify(&verified),
                        Err(e) => ClassifiedError::from_error(&e),
                    }
                }
            };

            warn!(
                task_id = %task.id,
                attempt = attempts,
                kind = %failure.kind,
                "attempt failed"
            );

            if !failure.kind.is_retryable() {
                state.transition(TaskStatus::Failed)?;
                last_error = Some(failure);
                break;
            }
            state.transition(TaskStatus::Retrying)?;
            last_error = Some(failure);
        }

        if state.status() == TaskStatus::Retrying {
            state.transition(TaskStatus::Failed)?;
        }

        match state.status() {
            TaskStatus::Succeeded => {
                if let Some(inputs) = inputs.as_deref() {
                    self.cache_store(&task, inputs, &summary).await;
                }
                info!(task_id = %task.id, attempts, "task succeeded");
            }
            status => {
                if let Some(error) = &last_error {
                    summary = error.to_string();
                }
                warn!(task_id = %task.id, attempts, %status, "task failed");
            }
        }

        Ok(TaskExecution {
            execution_id: Uuid::new_v4(),
            task_id: task.id.clone(),
            status: state.status(),
            attempts,
            retry_count: attempts.saturating_sub(1),
            duration_ms: clock.elapsed().as_millis() as u64,
            error: last_error,
            summary,
            files_written,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
