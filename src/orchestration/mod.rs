//! Orchestration layer: everything that turns a validated task graph into
//! executed, verified and recorded work.
//!
//! The [`Engine`] is the entry point. It layers the graph into waves and
//! hands them to the [`WaveRunner`], which drives each task through the
//! [`ExecutionCoordinator`] using the injected [`Executor`] and
//! [`Verifier`] collaborators.

mod classify;
mod collaborators;
mod coordinator;
mod engine;
mod executor;
mod retry;
mod runner;
mod verifier;

pub use classify::{classify, remediation_hint, FailureKind};
pub use collaborators::{ExecutionRequest, Executor, ExecutorOutput, Verifier, VerifyOutput};
pub use coordinator::{ClassifiedError, ExecutionCoordinator, ExecutionState, StatusChange, TaskExecution};
pub use engine::{DryRunEntry, DryRunReport, Engine, PlannedAction, RunOptions, RunResult};
pub use executor::CommandExecutor;
pub use retry::BackoffPolicy;
pub use runner::{RunEvent, RunOutcome, WaveOutcome, WaveRunner};
pub use verifier::{CommandPolicy, ShellVerifier};
