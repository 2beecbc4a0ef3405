//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: Failures that abort a run (graph errors, ledger I/O)
//! - WARN: Task failures, retries, blocked or forbidden commands
//! - INFO: Run and wave boundaries, task outcomes
//! - DEBUG: Cache lookups, attempt details, ledger writes
//! - TRACE: Collaborator output
//!
//! Debug mode can be enabled with `--debug` flag or `WAVERUN_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "WAVERUN_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls only update the debug flag.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "waverun=debug"
    } else {
        "waverun=info"
    }
}
