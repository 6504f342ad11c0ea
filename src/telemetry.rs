use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::error;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "AGENT_METER_LOG";

/// Installs the global subscriber. `AGENT_METER_LOG` wins over `default_level`.
/// Output goes to stderr so command output on stdout stays parseable.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    RecordUsage,
    UpsertDailySummary,
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerOperation::RecordUsage => f.write_str("record_usage"),
            LedgerOperation::UpsertDailySummary => f.write_str("upsert_daily_summary"),
        }
    }
}

/// A ledger write that failed and was not propagated to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceFailure {
    pub operation: LedgerOperation,
    pub agent: String,
    pub message: String,
}

/// Where swallowed persistence failures are reported.
pub trait FailureSink: Send + Sync {
    fn report(&self, failure: PersistenceFailure);
}

/// Reports failures as `error` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn report(&self, failure: PersistenceFailure) {
        error!(
            operation = %failure.operation,
            agent = %failure.agent,
            error = %failure.message,
            "ledger write failed; continuing without it"
        );
    }
}

/// Keeps failures in memory so they can be inspected.
#[derive(Debug, Default)]
pub struct MemorySink {
    failures: Mutex<Vec<PersistenceFailure>>,
}

impl MemorySink {
    pub fn failures(&self) -> Vec<PersistenceFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl FailureSink for MemorySink {
    fn report(&self, failure: PersistenceFailure) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
}
