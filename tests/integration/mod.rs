//! Integration test suite for waverun.
//!
//! These tests drive the engine end to end with scripted collaborators:
//! graph construction and layering, retries and failure propagation,
//! the result cache, and the run ledger.
//!
//! # Test Categories
//!
//! - `graph`: Dependency inference, cycle and producer errors, layering
//! - `execution`: Retries, abort and continue-on-failure, concurrency
//! - `caching`: Cache idempotence, invalidation, dry runs
//! - `resume`: Ledger records, resume after failure, stop requests
//!
//! # CI Compatibility
//!
//! No test spawns an external executor; the only child processes are
//! `sh -c` verify commands in the shell verifier tests.

mod fixtures;

mod caching;
mod graph;
mod resume;
