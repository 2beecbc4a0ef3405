//! Run entry point: graph, waves, dispatch, result.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::{read_input_bytes, CacheLookup, CacheOutcome, CacheStore};
use crate::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT_SECS, DEFAULT_VERIFY_TIMEOUT_SECS,
};
use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::core::wave::{layer, Wave};
use crate::orchestration::collaborators::{Executor, Verifier};
use crate::orchestration::coordinator::{ExecutionCoordinator, TaskExecution};
use crate::orchestration::retry::BackoffPolicy;
use crate::orchestration::runner::{RunEvent, WaveRunner};
use crate::state::ledger::RunLedger;
use crate::util::blocking;
use crate::Result;

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker limit per wave; 1 means strictly sequential in plan order.
    pub concurrency: usize,
    pub continue_on_failure: bool,
    pub cache_enabled: bool,
    /// Skip cache lookups but still store successes.
    pub force: bool,
    /// Skip tasks the ledger already records as done.
    pub resume: bool,
    pub max_retries: u32,
    pub verify_timeout: Duration,
    pub task_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            continue_on_failure: false,
            cache_enabled: true,
            force: false,
            resume: false,
            max_retries: DEFAULT_MAX_RETRIES,
            verify_timeout: Duration::from_secs(DEFAULT_VERIFY_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Structured result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub waves: Vec<Wave>,
    /// Every task's record, in the order outcomes were recorded.
    pub executions: Vec<TaskExecution>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub aborted: bool,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.aborted
    }

    pub fn execution(&self, task_id: &TaskId) -> Option<&TaskExecution> {
        self.executions.iter().find(|e| &e.task_id == task_id)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// What a run would do with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedAction {
    Run,
    Cached,
    Resumed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunEntry {
    pub task_id: TaskId,
    pub wave: usize,
    pub action: PlannedAction,
}

/// Accounting of a run without executing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DryRunReport {
    pub waves: Vec<Wave>,
    pub entries: Vec<DryRunEntry>,
}

impl DryRunReport {
    pub fn count(&self, action: PlannedAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }
}

/// The scheduling engine.
///
/// Holds the injected collaborators plus the optional shared cache and
/// ledger. Each call to [`Engine::run`] rebuilds the graph from scratch.
pub struct Engine {
    executor: Arc<dyn Executor>,
    verifier: Arc<dyn Verifier>,
    project_root: PathBuf,
    cache: Option<Arc<CacheStore>>,
    ledger: Option<Arc<RunLedger>>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl Engine {
    pub fn new(
        executor: Arc<dyn Executor>,
        verifier: Arc<dyn Verifier>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            verifier,
            project_root: project_root.into(),
            cache: None,
            ledger: None,
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<RunLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Progress events. The receiver must be drained while the run is
    /// in progress.
    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn plan(&self, tasks: &[Task]) -> Result<(TaskDAG, Vec<Wave>)> {
        let dag = TaskDAG::build(tasks).inspect_err(|e| error!(error = %e, "invalid task graph"))?;
        let waves = layer(&dag)?;
        Ok((dag, waves))
    }

    async fn resumed_tasks(&self, dag: &TaskDAG, options: &RunOptions) -> Result<HashSet<TaskId>> {
        let Some(ledger) = self.ledger.as_ref().filter(|_| options.resume) else {
            return Ok(HashSet::new());
        };
        let ledger = Arc::clone(ledger);
        let done = blocking(move || ledger.completed_tasks()).await?;
        Ok(done.into_iter().filter(|id| dag.contains_task(id)).collect())
    }

    /// Execute a task list.
    ///
    /// Graph errors (cycle, duplicate producer, unknown or duplicate id)
    /// return `Err` before anything is dispatched. Task failures never do;
    /// they are reported in the [`RunResult`].
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        let clock = Instant::now();
        let (dag, waves) = self.plan(&tasks)?;
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            tasks = dag.task_count(),
            waves = waves.len(),
            concurrency = options.concurrency,
            "run started"
        );

        let resumed = self.resumed_tasks(&dag, &options).await?;
        if let Some(ledger) = &self.ledger {
            let ledger = Arc::clone(ledger);
            let order: Vec<TaskId> = dag.tasks().map(|t| t.id.clone()).collect();
            blocking(move || ledger.begin_run(run_id, order)).await?;
        }

        let mut coordinator = ExecutionCoordinator::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.verifier),
            self.project_root.clone(),
            options,
        );
        if let Some(cache) = &self.cache {
            coordinator = coordinator.with_cache(Arc::clone(cache));
        }
        if let Some(events) = &self.events {
            coordinator = coordinator.with_events(events.clone());
        }

        let mut runner = WaveRunner::new(Arc::new(coordinator)).with_resumed(resumed);
        if let Some(ledger) = &self.ledger {
            runner = runner.with_ledger(Arc::clone(ledger));
        }
        if let Some(events) = &self.events {
            runner = runner.with_events(events.clone());
        }

        let outcome = runner.run(&dag, &waves, &cancel).await?;

        let count = |pred: fn(&TaskStatus) -> bool| {
            outcome.executions.iter().filter(|e| pred(&e.status)).count()
        };
        let result = RunResult {
            run_id,
            succeeded: count(|s| *s == TaskStatus::Succeeded),
            failed: count(|s| *s == TaskStatus::Failed),
            skipped: count(|s| matches!(s, TaskStatus::Skipped { .. })),
            duration_ms: clock.elapsed().as_millis() as u64,
            aborted: outcome.aborted,
            waves,
            executions: outcome.executions,
        };
        info!(
            %run_id,
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            aborted = result.aborted,
            "run finished"
        );
        Ok(result)
    }

    /// Report what [`Engine::run`] would do without executing anything.
    ///
    /// A task reports `Cached` only if its inputs already match a stored
    /// success; inputs that an earlier wave has yet to produce count as
    /// `Run`.
    pub async fn dry_run(&self, tasks: Vec<Task>, options: &RunOptions) -> Result<DryRunReport> {
        let (dag, waves) = self.plan(&tasks)?;
        let resumed = self.resumed_tasks(&dag, options).await?;
        let cache = self
            .cache
            .as_ref()
            .filter(|_| options.cache_enabled && !options.force)
            .cloned();

        let mut entries = Vec::with_capacity(dag.task_count());
        for wave in &waves {
            for task_id in &wave.task_ids {
                let action = if resumed.contains(task_id) {
                    PlannedAction::Resumed
                } else if let (Some(cache), Some(task)) = (&cache, dag.get_task(task_id)) {
                    let cache = Arc::clone(cache);
                    let task = Arc::clone(task);
                    let root = self.project_root.clone();
                    let hit = blocking(move || {
                        let inputs = read_input_bytes(&root, &task)?;
                        Ok(matches!(
                            cache.lookup(&task, &inputs),
                            CacheLookup::Hit(entry) if entry.outcome == CacheOutcome::Succeeded
                                && entry.is_restorable(&root, &task)
                        ))
                    })
                    .await?;
                    if hit {
                        PlannedAction::Cached
                    } else {
                        PlannedAction::Run
                    }
                } else {
                    PlannedAction::Run
                };
                entries.push(DryRunEntry {
                    task_id: task_id.clone(),
                    wave: wave.number,
                    action,
                });
            }
        }

        Ok(DryRunReport { waves, entries })
    }
}
