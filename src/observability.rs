// Centralized Observability Infrastructure
// Structured logging via tracing plus a small set of global atomic counters
// that `status` and `doctor` surface as a metrics snapshot. Logs always go
// to stderr: stdout belongs to the framed JSON-RPC transport.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Global atomic counters for metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static SEARCH_COUNTER: AtomicU64 = AtomicU64::new(0);
static INDEX_COMMIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static READ_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging infrastructure with defaults.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    // Determine the filter level based on flags
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("sari=debug,info")
    } else {
        // Default: warnings and errors for sari, only errors for dependencies
        EnvFilter::new("sari=warn,error")
    };

    // Quiet takes precedence over RUST_LOG; otherwise the environment wins.
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    // stdout carries framed responses, so all log output goes to stderr.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(!quiet)
        .with_ansi(false);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Counter categories tracked globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Operations,
    Errors,
    Searches,
    IndexCommits,
    Reads,
}

/// Record one occurrence of a counted event.
pub fn record(counter: Counter) {
    let cell = match counter {
        Counter::Operations => &OPERATION_COUNTER,
        Counter::Errors => &ERROR_COUNTER,
        Counter::Searches => &SEARCH_COUNTER,
        Counter::IndexCommits => &INDEX_COMMIT_COUNTER,
        Counter::Reads => &READ_COUNTER,
    };
    cell.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of the global counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub searches: u64,
    pub index_commits: u64,
    pub reads: u64,
}

/// Capture the current counter values.
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        operations: OPERATION_COUNTER.load(Ordering::Relaxed),
        errors: ERROR_COUNTER.load(Ordering::Relaxed),
        searches: SEARCH_COUNTER.load(Ordering::Relaxed),
        index_commits: INDEX_COMMIT_COUNTER.load(Ordering::Relaxed),
        reads: READ_COUNTER.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = metrics_snapshot();
        record(Counter::Searches);
        record(Counter::Searches);
        record(Counter::Errors);
        let after = metrics_snapshot();
        assert!(after.searches >= before.searches + 2);
        assert!(after.errors >= before.errors + 1);
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging().is_ok());
        assert!(init_logging_with_level(true, false).is_ok());
    }
}
