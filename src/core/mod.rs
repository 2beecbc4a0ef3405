//! Core domain models for wave-based task execution.
//!
//! This module contains the fundamental data structures used throughout
//! the engine: tasks, the dependency DAG, and its wave layering.

pub mod dag;
pub mod task;
pub mod wave;

pub use dag::{DependencyType, TaskDAG};
pub use task::{Plan, SkipReason, Task, TaskId, TaskStatus};
pub use wave::{layer, Wave};
