pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use crate::core::{Plan, SkipReason, Task, TaskDAG, TaskId, TaskStatus, Wave};
pub use error::{Error, Result};
pub use orchestration::{Engine, RunOptions, RunResult};
