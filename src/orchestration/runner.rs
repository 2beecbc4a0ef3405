//! Wave-by-wave dispatch with bounded concurrency.
//!
//! Waves run strictly one after another. Inside a wave, tasks go through
//! the [`ExecutionCoordinator`] under a semaphore; outcomes are recorded in
//! completion order. A task whose dependency did not succeed is never
//! dispatched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::dag::TaskDAG;
use crate::core::task::{SkipReason, TaskId, TaskStatus};
use crate::core::wave::Wave;
use crate::orchestration::classify::FailureKind;
use crate::orchestration::coordinator::{ExecutionCoordinator, TaskExecution};
use crate::state::ledger::RunLedger;
use crate::util::blocking;
use crate::{Error, Result};

/// Progress notifications for a run.
///
/// Sending is best effort; a dropped receiver never affects the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    WaveStarted {
        wave: usize,
        task_ids: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        wave: usize,
    },
    TaskRetrying {
        task_id: TaskId,
        /// The attempt about to start (2 for the first retry).
        attempt: u32,
        kind: FailureKind,
        delay: Duration,
    },
    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        attempts: u32,
    },
    WaveFinished {
        wave: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    RunAborted {
        reason: String,
    },
}

/// Outcomes of one wave, in completion order.
#[derive(Debug, Clone)]
pub struct WaveOutcome {
    pub wave: usize,
    pub executions: Vec<TaskExecution>,
}

impl WaveOutcome {
    pub fn has_failures(&self) -> bool {
        self.executions
            .iter()
            .any(|e| e.status == TaskStatus::Failed)
    }

    fn count(&self, pred: impl Fn(&TaskStatus) -> bool) -> usize {
        self.executions.iter().filter(|e| pred(&e.status)).count()
    }
}

/// Everything the runner produced across all waves.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub executions: Vec<TaskExecution>,
    pub aborted: bool,
}

pub struct WaveRunner {
    coordinator: Arc<ExecutionCoordinator>,
    concurrency: usize,
    continue_on_failure: bool,
    resumed: HashSet<TaskId>,
    ledger: Option<Arc<RunLedger>>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl WaveRunner {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        let options = coordinator.options();
        let concurrency = options.concurrency.max(1);
        let continue_on_failure = options.continue_on_failure;
        Self {
            coordinator,
            concurrency,
            continue_on_failure,
            resumed: HashSet::new(),
            ledger: None,
            events: None,
        }
    }

    /// Tasks to record as `Skipped(resumed)` instead of dispatching.
    pub fn with_resumed(mut self, resumed: HashSet<TaskId>) -> Self {
        self.resumed = resumed;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    /// Persist and publish one outcome.
    async fn record(
        &self,
        wave: usize,
        execution: TaskExecution,
        statuses: &mut HashMap<TaskId, TaskStatus>,
        out: &mut Vec<TaskExecution>,
    ) -> Result<()> {
        if let Some(ledger) = &self.ledger {
            let ledger = Arc::clone(ledger);
            let entry = execution.clone();
            blocking(move || ledger.record(&entry, wave)).await?;
        }
        statuses.insert(execution.task_id.clone(), execution.status);
        self.emit(RunEvent::TaskFinished {
            task_id: execution.task_id.clone(),
            status: execution.status,
            attempts: execution.attempts,
        })
        .await;
        out.push(execution);
        Ok(())
    }

    /// Run every wave in order.
    ///
    /// Returns `Err` only for infrastructure failures (ledger I/O). Task
    /// failures are in the returned executions.
    pub async fn run(
        &self,
        dag: &TaskDAG,
        waves: &[Wave],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mut statuses: HashMap<TaskId, TaskStatus> = HashMap::new();
        let mut outcome = RunOutcome::default();

        for (index, wave) in waves.iter().enumerate() {
            if outcome.aborted || cancel.is_cancelled() {
                if !outcome.aborted {
                    outcome.aborted = true;
                    self.emit(RunEvent::RunAborted {
                        reason: "stop requested".to_string(),
                    })
                    .await;
                }
                self.record_remaining(dag, &waves[index..], &mut statuses, &mut outcome.executions)
                    .await?;
                break;
            }

            info!(wave = wave.number, tasks = wave.len(), "wave started");
            self.emit(RunEvent::WaveStarted {
                wave: wave.number,
                task_ids: wave.task_ids.clone(),
            })
            .await;

            let wave_outcome = self.run_wave(dag, wave, &mut statuses, cancel).await?;

            let failed = wave_outcome.count(|s| *s == TaskStatus::Failed);
            let succeeded = wave_outcome.count(TaskStatus::is_success);
            let skipped = wave_outcome.count(|s| matches!(s, TaskStatus::Skipped { .. }));
            info!(wave = wave.number, succeeded, failed, skipped, "wave finished");
            self.emit(RunEvent::WaveFinished {
                wave: wave.number,
                succeeded,
                failed,
                skipped,
            })
            .await;

            let abort = wave_outcome.has_failures() && !self.continue_on_failure;
            outcome.executions.extend(wave_outcome.executions);
            if abort {
                warn!(wave = wave.number, "task failed, aborting remaining waves");
                outcome.aborted = true;
                self.emit(RunEvent::RunAborted {
                    reason: format!("task failure in wave {}", wave.number),
                })
                .await;
            }
        }

        Ok(outcome)
    }

    /// Dispatch one wave and wait for it to drain.
    pub async fn run_wave(
        &self,
        dag: &TaskDAG,
        wave: &Wave,
        statuses: &mut HashMap<TaskId, TaskStatus>,
        cancel: &CancellationToken,
    ) -> Result<WaveOutcome> {
        let mut executions = Vec::new();
        let mut ready = Vec::new();

        for task_id in &wave.task_ids {
            let skip = if self.resumed.contains(task_id) {
                Some((SkipReason::Resumed, "completed in a previous run".to_string()))
            } else if let Some(dep) = dag
                .dependencies(task_id)
                .into_iter()
                .find(|d| !statuses.get(*d).is_some_and(TaskStatus::is_success))
            {
                Some((SkipReason::Blocked, format!("dependency {} did not succeed", dep)))
            } else if cancel.is_cancelled() {
                Some((SkipReason::Aborted, "stop requested".to_string()))
            } else {
                None
            };

            match (skip, dag.get_task(task_id)) {
                (Some((reason, summary)), _) => {
                    info!(task_id = %task_id, %reason, "task skipped");
                    let execution = TaskExecution::skipped(task_id.clone(), reason, &summary);
                    self.record(wave.number, execution, statuses, &mut executions)
                        .await?;
                }
                (None, Some(task)) => ready.push(Arc::clone(task)),
                (None, None) => {
                    return Err(Error::Validation(format!(
                        "Task {} not found in DAG",
                        task_id
                    )))
                }
            }
        }

        if self.concurrency == 1 {
            for task in ready {
                let execution = if cancel.is_cancelled() {
                    TaskExecution::skipped(task.id.clone(), SkipReason::Aborted, "stop requested")
                } else {
                    self.emit(RunEvent::TaskStarted {
                        task_id: task.id.clone(),
                        wave: wave.number,
                    })
                    .await;
                    self.coordinator.run(task, cancel).await?
                };
                self.record(wave.number, execution, statuses, &mut executions)
                    .await?;
            }
        } else {
            let semaphore = Arc::new(Semaphore::new(self.concurrency));
            let mut in_flight = FuturesUnordered::new();

            for task in ready {
                let semaphore = Arc::clone(&semaphore);
                let coordinator = Arc::clone(&self.coordinator);
                let events = self.events.clone();
                let wave_number = wave.number;
                in_flight.push(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Validation("worker semaphore closed".into()))?;
                    if cancel.is_cancelled() {
                        return Ok(TaskExecution::skipped(
                            task.id.clone(),
                            SkipReason::Aborted,
                            "stop requested",
                        ));
                    }
                    if let Some(tx) = &events {
                        let _ = tx
                            .send(RunEvent::TaskStarted {
                                task_id: task.id.clone(),
                                wave: wave_number,
                            })
                            .await;
                    }
                    coordinator.run(task, cancel).await
                });
            }

            while let Some(result) = in_flight.next().await {
                self.record(wave.number, result?, statuses, &mut executions)
                    .await?;
            }
        }

        Ok(WaveOutcome {
            wave: wave.number,
            executions,
        })
    }

    /// Record every task of the waves that will not run.
    ///
    /// Tasks downstream of a failure are `Blocked`, the rest `Aborted`.
    async fn record_remaining(
        &self,
        dag: &TaskDAG,
        waves: &[Wave],
        statuses: &mut HashMap<TaskId, TaskStatus>,
        out: &mut Vec<TaskExecution>,
    ) -> Result<()> {
        for wave in waves {
            for task_id in &wave.task_ids {
                let blocked = dag.dependencies(task_id).into_iter().any(|d| {
                    matches!(
                        statuses.get(d),
                        Some(TaskStatus::Failed)
                            | Some(TaskStatus::Skipped {
                                reason: SkipReason::Blocked
                            })
                    )
                });
                let (reason, summary) = if blocked {
                    (SkipReason::Blocked, "dependency did not succeed")
                } else {
                    (SkipReason::Aborted, "run aborted before dispatch")
                };
                let execution = TaskExecution::skipped(task_id.clone(), reason, summary);
                self.record(wave.number, execution, statuses, out).await?;
            }
        }
        Ok(())
    }
}
