//! Cross-invocation run state.

pub mod ledger;

pub use ledger::{LedgerRecord, LedgerStatus, ResumePoint, RunLedger, StatusCounts};
