use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Circular dependency detected: {}", format_cycle(.cycle))]
    CircularDependency { cycle: Vec<TaskId> },

    #[error("File {file} is produced by both {first} and {second}")]
    DuplicateProducer {
        file: String,
        first: TaskId,
        second: TaskId,
    },

    #[error("Verify command blocked by denylist pattern `{pattern}`: {command}")]
    ForbiddenVerifyCommand { command: String, pattern: String },

    #[error("Verification timed out after {0:?}")]
    VerificationTimeout(Duration),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Whether this error aborts a run before anything is dispatched.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::CircularDependency { .. }
                | Error::DuplicateProducer { .. }
                | Error::DuplicateTaskId(_)
                | Error::UnknownDependency { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
