//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary project roots with cache and ledger directories
//! - A scripted executor that writes each task's produced file
//! - A scripted verifier with per-command failure budgets
//! - Predefined task sets

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use waverun::cache::CacheStore;
use waverun::orchestration::{
    BackoffPolicy, ExecutionRequest, Executor, ExecutorOutput, RunOptions, Verifier, VerifyOutput,
};
use waverun::state::RunLedger;
use waverun::{Engine, Result, Task, TaskId};

/// A throwaway project directory.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    pub fn write(&self, file: &str, content: &str) {
        let path = self.path.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    pub fn read(&self, file: &str) -> String {
        std::fs::read_to_string(self.path.join(file)).expect("Failed to read file")
    }

    pub fn cache(&self) -> Arc<CacheStore> {
        Arc::new(CacheStore::open(&self.path.join(".waverun/cache")).expect("Failed to open cache"))
    }

    pub fn ledger(&self) -> Arc<RunLedger> {
        Arc::new(
            RunLedger::open(&self.path.join(".waverun/ledger")).expect("Failed to open ledger"),
        )
    }
}

/// Executor that writes the produced file from the task id and the bytes
/// of its inputs, so upstream changes flow downstream.
///
/// Tracks every call and the peak number of calls in flight.
pub struct ScriptedExecutor {
    calls: Mutex<Vec<TaskId>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn calls(&self) -> Vec<TaskId> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == task_id)
            .count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutorOutput> {
        self.calls.lock().unwrap().push(request.task.id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut files_written = Vec::new();
        if let Some(produced) = request.task.produced_file() {
            let mut content = format!("# {}\n", request.task.id);
            for input in &request.inputs {
                if let Some(bytes) = &input.bytes {
                    content.push_str(&String::from_utf8_lossy(bytes));
                }
            }
            std::fs::write(request.project_root.join(produced), content)?;
            files_written.push(produced.to_string());
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecutorOutput {
            files_written,
            raw_output: format!("attempt {}", request.attempt),
        })
    }
}

/// Verifier that fails a command a fixed number of times before passing.
///
/// Commands without a budget always pass.
pub struct ScriptedVerifier {
    failures: Mutex<HashMap<String, (u32, String)>>,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_times(self, command: &str, times: u32, stderr: &str) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(command.to_string(), (times, stderr.to_string()));
        self
    }

    pub fn always_fail(self, command: &str, stderr: &str) -> Self {
        self.fail_times(command, u32::MAX, stderr)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for ScriptedVerifier {
    async fn verify(&self, command: &str, _timeout: Duration) -> Result<VerifyOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(command) {
            Some((remaining, stderr)) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                Ok(VerifyOutput {
                    exit_code: Some(1),
                    stdout: String::new(),
                    stderr: stderr.clone(),
                })
            }
            _ => Ok(VerifyOutput::passed()),
        }
    }
}

pub fn id(s: &str) -> TaskId {
    s.parse().expect("valid task id")
}

/// Task whose verify command is `check <id>`, so verifier budgets can
/// target it.
pub fn task(tid: &str, files: &[&str]) -> Task {
    Task::new(id(tid), &format!("task {}", tid))
        .with_files(files)
        .with_action(&format!("build {}", tid))
        .with_verify(&format!("check {}", tid))
}

/// Options with no backoff delay so retry tests stay fast.
pub fn fast_options() -> RunOptions {
    RunOptions {
        backoff: BackoffPolicy::none(),
        ..RunOptions::default()
    }
}

pub fn engine(
    root: &Path,
    executor: &Arc<ScriptedExecutor>,
    verifier: &Arc<ScriptedVerifier>,
) -> Engine {
    Engine::new(
        Arc::clone(executor) as Arc<dyn Executor>,
        Arc::clone(verifier) as Arc<dyn Verifier>,
        root,
    )
}

/// models -> api -> tests, plus an unrelated docs task in wave 1.
pub fn layered_plan() -> Vec<Task> {
    vec![
        task("1.1", &["models.py", "schema.sql"]),
        task("1.2", &["docs.md"]),
        task("2.1", &["api.py", "models.py"]),
        task("3.1", &["test_api.py", "api.py"]),
    ]
}

/// `count` independent tasks, all in one wave.
pub fn wide_plan(count: usize) -> Vec<Task> {
    (1..=count)
        .map(|i| task(&format!("1.{}", i), &[&format!("out_{}.txt", i)]))
        .collect()
}
