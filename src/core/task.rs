//! Task data model for the execution DAG.
//!
//! Tasks are immutable descriptions of one unit of file-producing work.
//! They are rebuilt from the persisted plan at the start of every run and
//! shared read-only between workers.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::error::{Error, Result};

/// Identifier of a task in dotted `phase.index` form, e.g. `1.2`.
///
/// Ordering compares dot-separated segments numerically when both are
/// numbers, so `1.10` sorts after `1.9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: &str) -> Result<Self> {
        let trimmed = id.trim();
        if trimmed.is_empty()
            || trimmed.chars().any(char::is_whitespace)
            || trimmed.split('.').any(str::is_empty)
        {
            return Err(Error::InvalidTaskId(id.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The phase number, when the first segment is numeric.
    pub fn phase(&self) -> Option<u32> {
        self.0.split('.').next()?.parse().ok()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.split('.');
        let mut right = other.0.split('.');
        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                        (Ok(x), Ok(y)) => x.cmp(&y),
                        _ => a.cmp(b),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Why a task reached `Skipped` without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// An identical prior success was replayed from the cache.
    Cached,
    /// A direct dependency did not succeed.
    Blocked,
    /// The run aborted before this task was dispatched.
    Aborted,
    /// A previous run already recorded this task as done.
    Resumed,
}

impl SkipReason {
    /// Whether dependents may treat this skip as a satisfied dependency.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, SkipReason::Cached | SkipReason::Resumed)
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Cached => write!(f, "cached"),
            SkipReason::Blocked => write!(f, "blocked"),
            SkipReason::Aborted => write!(f, "aborted"),
            SkipReason::Resumed => write!(f, "resumed"),
        }
    }
}

/// Execution status of a task within one run.
///
/// `Pending`, `Running`, `Verifying` and `Retrying` are transient; the
/// rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    Pending,
    Running,
    Verifying,
    Retrying,
    Succeeded,
    Failed,
    Skipped { reason: SkipReason },
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped { .. }
        )
    }

    /// Whether a dependent task may be dispatched after this outcome.
    pub fn is_success(&self) -> bool {
        match self {
            TaskStatus::Succeeded => true,
            TaskStatus::Skipped { reason } => reason.satisfies_dependents(),
            _ => false,
        }
    }

    /// Valid transitions of the per-task state machine:
    ///
    /// - Pending -> Running | Skipped
    /// - Running -> Verifying | Retrying | Failed
    /// - Verifying -> Succeeded | Retrying | Failed
    /// - Retrying -> Running | Failed
    pub fn can_transition(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Skipped { .. })
                | (TaskStatus::Running, TaskStatus::Verifying)
                | (TaskStatus::Running, TaskStatus::Retrying)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Verifying, TaskStatus::Succeeded)
                | (TaskStatus::Verifying, TaskStatus::Retrying)
                | (TaskStatus::Verifying, TaskStatus::Failed)
                | (TaskStatus::Retrying, TaskStatus::Running)
                | (TaskStatus::Retrying, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Verifying => write!(f, "verifying"),
            TaskStatus::Retrying => write!(f, "retrying"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped { reason } => write!(f, "skipped ({})", reason),
        }
    }
}

/// A single unit of work.
///
/// The file contract is explicit: `produces` is the one file this task
/// writes, `inputs` are files it reads. A task that consumes another
/// task's produced file depends on that task. Paths are opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub produces: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Instruction text handed to the executor.
    #[serde(default)]
    pub action: String,
    /// Shell command used to verify the task's output.
    #[serde(default)]
    pub verify: String,
    /// Acceptance description, not machine-checked.
    #[serde(default)]
    pub done: String,
    /// Explicit dependency ids, added on top of file-inferred edges.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
}

impl Task {
    pub fn new(id: TaskId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            produces: None,
            inputs: Vec::new(),
            action: String::new(),
            verify: String::new(),
            done: String::new(),
            depends_on: Vec::new(),
        }
    }

    /// Apply the plan's positional file convention: the first entry is the
    /// produced file, the rest are inputs.
    pub fn with_files<S: AsRef<str>>(mut self, files: &[S]) -> Self {
        let mut iter = files.iter().map(|f| f.as_ref().to_string());
        self.produces = iter.next();
        self.inputs = iter.collect();
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }

    pub fn with_verify(mut self, verify: &str) -> Self {
        self.verify = verify.to_string();
        self
    }

    pub fn with_done(mut self, done: &str) -> Self {
        self.done = done.to_string();
        self
    }

    pub fn with_dependency(mut self, id: TaskId) -> Self {
        if !self.depends_on.contains(&id) {
            self.depends_on.push(id);
        }
        self
    }

    pub fn produced_file(&self) -> Option<&str> {
        self.produces.as_deref()
    }

    pub fn input_files(&self) -> &[String] {
        &self.inputs
    }

    /// All declared files in plan order, produced file first.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.produces
            .iter()
            .chain(self.inputs.iter())
            .map(String::as_str)
    }
}

/// A plan document: the task list as the CLI reads it from disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<Task>,
}
