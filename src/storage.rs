use crate::error::AppError;
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Money columns hold integer micro-dollars (`*_micros`) so sums stay exact.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,

    run_id                  TEXT,
    ticker                  TEXT,
    triggered_by            TEXT NOT NULL,

    agent_name              TEXT NOT NULL,
    agent_id                TEXT NOT NULL,
    agent_role              TEXT,

    api_provider            TEXT NOT NULL,
    api_endpoint            TEXT,
    model                   TEXT NOT NULL,
    model_tier              TEXT NOT NULL,

    input_tokens            INTEGER NOT NULL DEFAULT 0,
    input_cached_tokens     INTEGER NOT NULL DEFAULT 0,
    input_uncached_tokens   INTEGER NOT NULL DEFAULT 0,
    output_tokens           INTEGER NOT NULL DEFAULT 0,
    thinking_tokens         INTEGER NOT NULL DEFAULT 0,
    response_tokens         INTEGER NOT NULL DEFAULT 0,
    total_tokens            INTEGER NOT NULL DEFAULT 0,

    input_cost_micros       INTEGER NOT NULL DEFAULT 0,
    output_cost_micros      INTEGER NOT NULL DEFAULT 0,
    thinking_cost_micros    INTEGER NOT NULL DEFAULT 0,
    total_cost_micros       INTEGER NOT NULL DEFAULT 0,

    prompt_cache_status     TEXT NOT NULL DEFAULT 'none',
    cache_creation_tokens   INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens       INTEGER NOT NULL DEFAULT 0,

    request_started_at      TEXT NOT NULL,
    request_completed_at    TEXT NOT NULL,
    latency_ms              INTEGER NOT NULL,

    http_status_code        INTEGER,
    request_id              TEXT,

    is_error                INTEGER NOT NULL DEFAULT 0,
    was_retry               INTEGER NOT NULL DEFAULT 0,
    retry_count             INTEGER NOT NULL DEFAULT 0,
    error_type              TEXT,
    error_message           TEXT,

    environment             TEXT NOT NULL,
    app_version             TEXT NOT NULL,

    created_date            TEXT NOT NULL,
    created_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_usage_date     ON usage_records(created_date);
CREATE INDEX IF NOT EXISTS idx_usage_agent    ON usage_records(agent_name);
CREATE INDEX IF NOT EXISTS idx_usage_run      ON usage_records(run_id);
CREATE INDEX IF NOT EXISTS idx_usage_provider ON usage_records(api_provider);
CREATE INDEX IF NOT EXISTS idx_usage_model    ON usage_records(model);
CREATE INDEX IF NOT EXISTS idx_usage_ticker   ON usage_records(ticker);

CREATE TABLE IF NOT EXISTS daily_activity (
    day                     TEXT NOT NULL,
    agent_id                TEXT NOT NULL,

    what_i_did              TEXT,
    wins                    TEXT,
    losses                  TEXT,
    struggles               TEXT,
    blockers                TEXT,

    runs_completed          INTEGER NOT NULL DEFAULT 0,
    api_calls               INTEGER NOT NULL DEFAULT 0,
    total_tokens            INTEGER NOT NULL DEFAULT 0,
    total_cost_micros       INTEGER NOT NULL DEFAULT 0,
    errors                  INTEGER NOT NULL DEFAULT 0,
    avg_latency_ms          INTEGER,

    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL,

    PRIMARY KEY (day, agent_id)
);
"#;

/// Opens a fresh connection for a single unit of work. Callers drop it
/// before returning; no connection outlives one ledger operation.
pub fn open_connection(path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Creates tables and indexes if missing. Safe to run on every startup.
pub fn ensure_schema(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = open_connection(path)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Row counts per table, for health output.
pub fn table_row_counts(path: &Path) -> Result<Vec<(&'static str, i64)>, AppError> {
    let conn = open_connection(path)?;
    let mut counts = Vec::new();
    for table in ["usage_records", "daily_activity"] {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        counts.push((table, count));
    }
    Ok(counts)
}
