use crate::cost::{usd_from_micros, usd_to_micros};
use crate::error::AppError;
use crate::models::{CostBreakdown, StoredUsageRecord, TokenUsage, UsageRecord};
use crate::storage::open_connection;
use crate::telemetry::{FailureSink, LedgerOperation, PersistenceFailure};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{named_params, types::Type, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const INSERT_USAGE: &str = r#"
INSERT INTO usage_records (
    run_id, ticker, triggered_by,
    agent_name, agent_id, agent_role,
    api_provider, api_endpoint, model, model_tier,
    input_tokens, input_cached_tokens, input_uncached_tokens,
    output_tokens, thinking_tokens, response_tokens, total_tokens,
    input_cost_micros, output_cost_micros, thinking_cost_micros, total_cost_micros,
    prompt_cache_status, cache_creation_tokens, cache_read_tokens,
    request_started_at, request_completed_at, latency_ms,
    http_status_code, request_id,
    is_error, was_retry, retry_count, error_type, error_message,
    environment, app_version, created_date, created_at
) VALUES (
    :run_id, :ticker, :triggered_by,
    :agent_name, :agent_id, :agent_role,
    :api_provider, :api_endpoint, :model, :model_tier,
    :input_tokens, :input_cached_tokens, :input_uncached_tokens,
    :output_tokens, :thinking_tokens, :response_tokens, :total_tokens,
    :input_cost_micros, :output_cost_micros, :thinking_cost_micros, :total_cost_micros,
    :prompt_cache_status, :cache_creation_tokens, :cache_read_tokens,
    :request_started_at, :request_completed_at, :latency_ms,
    :http_status_code, :request_id,
    :is_error, :was_retry, :retry_count, :error_type, :error_message,
    :environment, :app_version, :created_date, :created_at
)
"#;

const SELECT_USAGE: &str = r#"
SELECT id, run_id, ticker, triggered_by, agent_name, agent_id, agent_role,
       api_provider, api_endpoint, model, model_tier,
       input_tokens, output_tokens, thinking_tokens, cache_creation_tokens, cache_read_tokens,
       input_cost_micros, output_cost_micros, thinking_cost_micros, total_cost_micros,
       prompt_cache_status, request_started_at, request_completed_at, latency_ms,
       http_status_code, request_id, retry_count, is_error, error_type, error_message,
       environment, app_version, created_date
FROM usage_records
"#;

/// Append-only store of one row per metered call.
///
/// Every write opens its own connection and runs a single insert in its own
/// transaction. Write failures never reach the caller: they go to the
/// configured [`FailureSink`] instead.
#[derive(Clone)]
pub struct UsageLedger {
    db_path: PathBuf,
    sink: Arc<dyn FailureSink>,
}

impl UsageLedger {
    pub fn new(db_path: impl Into<PathBuf>, sink: Arc<dyn FailureSink>) -> Self {
        Self {
            db_path: db_path.into(),
            sink,
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Best-effort append; failures are reported, never returned.
    pub fn record(&self, usage: &UsageRecord) {
        if let Err(err) = self.try_record(usage) {
            self.sink.report(PersistenceFailure {
                operation: LedgerOperation::RecordUsage,
                agent: usage.agent_name.clone(),
                message: err.to_string(),
            });
        }
    }

    /// Appends one row and returns its id.
    pub fn try_record(&self, usage: &UsageRecord) -> Result<i64, AppError> {
        let mut conn = open_connection(&self.db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tokens = &usage.tokens;
        tx.execute(
            INSERT_USAGE,
            named_params! {
                ":run_id": usage.run_id,
                ":ticker": usage.ticker,
                ":triggered_by": usage.triggered_by,
                ":agent_name": usage.agent_name,
                ":agent_id": usage.agent_id,
                ":agent_role": usage.agent_role,
                ":api_provider": usage.api_provider,
                ":api_endpoint": usage.api_endpoint,
                ":model": usage.model,
                ":model_tier": usage.model_tier().as_str(),
                ":input_tokens": tokens.input_tokens,
                ":input_cached_tokens": tokens.cache_read_tokens,
                ":input_uncached_tokens": tokens.uncached_input_tokens(),
                ":output_tokens": tokens.output_tokens,
                ":thinking_tokens": tokens.estimated_thinking_tokens,
                ":response_tokens": tokens.response_tokens(),
                ":total_tokens": tokens.total_tokens(),
                ":input_cost_micros": usd_to_micros(usage.cost.input_cost),
                ":output_cost_micros": usd_to_micros(usage.cost.output_cost),
                ":thinking_cost_micros": usd_to_micros(usage.cost.thinking_cost),
                ":total_cost_micros": usd_to_micros(usage.cost.total_cost),
                ":prompt_cache_status": usage.cache_status().as_str(),
                ":cache_creation_tokens": tokens.cache_write_tokens,
                ":cache_read_tokens": tokens.cache_read_tokens,
                ":request_started_at": usage.request_started_at.to_rfc3339(),
                ":request_completed_at": usage.request_completed_at.to_rfc3339(),
                ":latency_ms": usage.latency_ms,
                ":http_status_code": usage.http_status_code,
                ":request_id": usage.request_id,
                ":is_error": usage.is_error,
                ":was_retry": usage.retry_count > 0,
                ":retry_count": usage.retry_count,
                ":error_type": usage.error_type,
                ":error_message": usage.error_message,
                ":environment": usage.environment,
                ":app_version": usage.app_version,
                ":created_date": usage.created_date().to_string(),
                ":created_at": Utc::now().to_rfc3339(),
            },
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// All rows in insertion order.
    pub fn records(&self) -> Result<Vec<StoredUsageRecord>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let mut stmt = conn.prepare(&format!("{SELECT_USAGE} ORDER BY id"))?;
        let rows = stmt
            .query_map([], stored_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows for one run, ordered by completion time then id.
    pub fn records_for_run(&self, run_id: &str) -> Result<Vec<StoredUsageRecord>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_USAGE} WHERE run_id = ? ORDER BY request_completed_at, id"
        ))?;
        let rows = stmt
            .query_map([run_id], stored_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn conversion_error(
    idx: usize,
    kind: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, kind, Box::new(err))
}

fn get_u64(row: &Row<'_>, name: &str) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(name)?;
    let idx = row.as_ref().column_index(name)?;
    u64::try_from(raw).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn get_timestamp(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    let idx = row.as_ref().column_index(name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn get_parsed<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(name)?;
    let idx = row.as_ref().column_index(name)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, Type::Text, std::io::Error::other(e)))
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredUsageRecord> {
    let http_status_code: Option<i64> = row.get("http_status_code")?;
    let created_raw: String = row.get("created_date")?;
    let created_idx = row.as_ref().column_index("created_date")?;
    let created_date = NaiveDate::parse_from_str(&created_raw, "%Y-%m-%d")
        .map_err(|e| conversion_error(created_idx, Type::Text, e))?;
    let retry_count: i64 = row.get("retry_count")?;

    let record = UsageRecord {
        agent_name: row.get("agent_name")?,
        agent_id: row.get("agent_id")?,
        agent_role: row.get("agent_role")?,
        run_id: row.get("run_id")?,
        ticker: row.get("ticker")?,
        triggered_by: row.get("triggered_by")?,
        api_provider: row.get("api_provider")?,
        api_endpoint: row.get("api_endpoint")?,
        model: row.get("model")?,
        tokens: TokenUsage {
            input_tokens: get_u64(row, "input_tokens")?,
            output_tokens: get_u64(row, "output_tokens")?,
            cache_read_tokens: get_u64(row, "cache_read_tokens")?,
            cache_write_tokens: get_u64(row, "cache_creation_tokens")?,
            estimated_thinking_tokens: get_u64(row, "thinking_tokens")?,
        },
        cost: CostBreakdown {
            input_cost: usd_from_micros(row.get("input_cost_micros")?),
            output_cost: usd_from_micros(row.get("output_cost_micros")?),
            thinking_cost: usd_from_micros(row.get("thinking_cost_micros")?),
            total_cost: usd_from_micros(row.get("total_cost_micros")?),
        },
        request_started_at: get_timestamp(row, "request_started_at")?,
        request_completed_at: get_timestamp(row, "request_completed_at")?,
        latency_ms: get_u64(row, "latency_ms")?,
        request_id: row.get("request_id")?,
        http_status_code: http_status_code.and_then(|s| u16::try_from(s).ok()),
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        is_error: row.get("is_error")?,
        error_type: row.get("error_type")?,
        error_message: row.get("error_message")?,
        environment: row.get("environment")?,
        app_version: row.get("app_version")?,
    };

    Ok(StoredUsageRecord {
        id: row.get("id")?,
        cache_status: get_parsed(row, "prompt_cache_status")?,
        model_tier: get_parsed(row, "model_tier")?,
        created_date,
        record,
    })
}
