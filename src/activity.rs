use crate::cost::{usd_from_micros, usd_to_micros};
use crate::error::AppError;
use crate::models::{ActivityTotals, DailyActivitySummary, SummaryText};
use crate::storage::open_connection;
use crate::telemetry::{FailureSink, LedgerOperation, PersistenceFailure};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{named_params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const AGGREGATE_DAY: &str = r#"
SELECT COUNT(DISTINCT run_id),
       COUNT(*),
       COALESCE(SUM(total_tokens), 0),
       COALESCE(SUM(total_cost_micros), 0),
       COALESCE(SUM(is_error), 0),
       CAST(ROUND(AVG(latency_ms)) AS INTEGER)
FROM usage_records
WHERE agent_name = :agent AND created_date = :day
"#;

const UPSERT_SUMMARY: &str = r#"
INSERT INTO daily_activity (
    day, agent_id,
    what_i_did, wins, losses, struggles, blockers,
    runs_completed, api_calls, total_tokens, total_cost_micros, errors, avg_latency_ms,
    created_at, updated_at
) VALUES (
    :day, :agent_id,
    :what_i_did, :wins, :losses, :struggles, :blockers,
    :runs_completed, :api_calls, :total_tokens, :total_cost_micros, :errors, :avg_latency_ms,
    :now, :now
)
ON CONFLICT(day, agent_id) DO UPDATE SET
    what_i_did        = excluded.what_i_did,
    wins              = excluded.wins,
    losses            = excluded.losses,
    struggles         = excluded.struggles,
    blockers          = excluded.blockers,
    runs_completed    = excluded.runs_completed,
    api_calls         = excluded.api_calls,
    total_tokens      = excluded.total_tokens,
    total_cost_micros = excluded.total_cost_micros,
    errors            = excluded.errors,
    avg_latency_ms    = excluded.avg_latency_ms,
    updated_at        = excluded.updated_at
"#;

const SELECT_SUMMARY: &str = r#"
SELECT day, agent_id, what_i_did, wins, losses, struggles, blockers,
       runs_completed, api_calls, total_tokens, total_cost_micros, errors, avg_latency_ms,
       created_at, updated_at
FROM daily_activity
"#;

/// Maintains one row per (day, agent) in `daily_activity`.
///
/// Numbers are recomputed from `usage_records` on every write, so the table
/// can be dropped and rebuilt from the ledger at any time. Free text is
/// last-writer-wins.
#[derive(Clone)]
pub struct ActivityAggregator {
    db_path: PathBuf,
    sink: Arc<dyn FailureSink>,
}

impl ActivityAggregator {
    pub fn new(db_path: impl Into<PathBuf>, sink: Arc<dyn FailureSink>) -> Self {
        Self {
            db_path: db_path.into(),
            sink,
        }
    }

    /// Best-effort upsert; failures are reported, never returned.
    pub fn upsert_daily_summary(&self, agent_id: &str, day: NaiveDate, text: &SummaryText) {
        if let Err(err) = self.try_upsert_daily_summary(agent_id, day, text) {
            self.sink.report(PersistenceFailure {
                operation: LedgerOperation::UpsertDailySummary,
                agent: agent_id.to_string(),
                message: err.to_string(),
            });
        }
    }

    /// Recomputes the day's totals and writes them in a single immediate
    /// transaction, so two writers for the same key serialize.
    pub fn try_upsert_daily_summary(
        &self,
        agent_id: &str,
        day: NaiveDate,
        text: &SummaryText,
    ) -> Result<ActivityTotals, AppError> {
        let mut conn = open_connection(&self.db_path)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let totals = aggregate_day(&tx, agent_id, day)?;
        tx.execute(
            UPSERT_SUMMARY,
            named_params! {
                ":day": day.to_string(),
                ":agent_id": agent_id,
                ":what_i_did": text.what_i_did,
                ":wins": text.wins,
                ":losses": text.losses,
                ":struggles": text.struggles,
                ":blockers": text.blockers,
                ":runs_completed": totals.runs_completed,
                ":api_calls": totals.api_calls,
                ":total_tokens": totals.total_tokens,
                ":total_cost_micros": usd_to_micros(totals.total_cost),
                ":errors": totals.errors,
                ":avg_latency_ms": totals.avg_latency_ms,
                ":now": Utc::now().to_rfc3339(),
            },
        )?;
        tx.commit()?;

        debug!(
            agent = agent_id,
            %day,
            api_calls = totals.api_calls,
            total_cost = %totals.total_cost,
            "daily summary upserted"
        );
        Ok(totals)
    }

    pub fn summary(
        &self,
        agent_id: &str,
        day: NaiveDate,
    ) -> Result<Option<DailyActivitySummary>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let summary = conn
            .query_row(
                &format!("{SELECT_SUMMARY} WHERE day = ?1 AND agent_id = ?2"),
                (day.to_string(), agent_id),
                summary_from_row,
            )
            .optional()?;
        Ok(summary)
    }

    /// Every agent's summary for `day`, by agent id.
    pub fn summaries_on(&self, day: NaiveDate) -> Result<Vec<DailyActivitySummary>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let mut stmt = conn.prepare(&format!("{SELECT_SUMMARY} WHERE day = ?1 ORDER BY agent_id"))?;
        let rows = stmt
            .query_map([day.to_string()], summary_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn non_negative(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

fn aggregate_day(conn: &Connection, agent_id: &str, day: NaiveDate) -> Result<ActivityTotals, AppError> {
    let totals = conn.query_row(
        AGGREGATE_DAY,
        named_params! { ":agent": agent_id, ":day": day.to_string() },
        |row| {
            let avg: Option<i64> = row.get(5)?;
            Ok(ActivityTotals {
                runs_completed: non_negative(row.get(0)?),
                api_calls: non_negative(row.get(1)?),
                total_tokens: non_negative(row.get(2)?),
                total_cost: usd_from_micros(row.get(3)?),
                errors: non_negative(row.get(4)?),
                avg_latency_ms: avg.map(non_negative),
            })
        },
    )?;
    Ok(totals)
}

fn parse_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, chrono::ParseError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|d| d.with_timezone(&Utc))
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<DailyActivitySummary> {
    let avg: Option<i64> = row.get(12)?;
    Ok(DailyActivitySummary {
        day: parse_column(row, 0, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))?,
        agent_id: row.get(1)?,
        text: SummaryText {
            what_i_did: row.get(2)?,
            wins: row.get(3)?,
            losses: row.get(4)?,
            struggles: row.get(5)?,
            blockers: row.get(6)?,
        },
        totals: ActivityTotals {
            runs_completed: non_negative(row.get(7)?),
            api_calls: non_negative(row.get(8)?),
            total_tokens: non_negative(row.get(9)?),
            total_cost: usd_from_micros(row.get(10)?),
            errors: non_negative(row.get(11)?),
            avg_latency_ms: avg.map(non_negative),
        },
        created_at: parse_column(row, 13, parse_timestamp)?,
        updated_at: parse_column(row, 14, parse_timestamp)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::UsageLedger;
    use crate::storage::ensure_schema;
    use crate::telemetry::MemorySink;
    use crate::testing::{at, failed, usage};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        ledger: UsageLedger,
        aggregator: ActivityAggregator,
        sink: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let db = tmp.path().join("ledger.sqlite");
        ensure_schema(&db).expect("schema");
        let sink = Arc::new(MemorySink::default());
        Fixture {
            ledger: UsageLedger::new(db.clone(), sink.clone()),
            aggregator: ActivityAggregator::new(db, sink.clone()),
            sink,
            _tmp: tmp,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 2).expect("date")
    }

    fn text(what: &str) -> SummaryText {
        SummaryText {
            what_i_did: Some(what.to_string()),
            ..SummaryText::default()
        }
    }

    #[test]
    fn totals_are_computed_from_the_ledger() {
        let f = fixture();
        let mut slow = usage("analyst", Some("run_1"), at(2026, 3, 2, 9), 1_500);
        slow.latency_ms = 2_001;
        f.ledger.record(&slow);
        f.ledger.record(&usage("analyst", Some("run_1"), at(2026, 3, 2, 10), 2_500));
        f.ledger.record(&usage("analyst", Some("run_2"), at(2026, 3, 2, 11), 1_000));
        f.ledger.record(&failed("analyst", Some("run_2"), at(2026, 3, 2, 12)));
        // Other agent and other day must not leak in.
        f.ledger.record(&usage("manager", Some("run_1"), at(2026, 3, 2, 9), 99_000));
        f.ledger.record(&usage("analyst", Some("run_3"), at(2026, 3, 3, 9), 99_000));

        let totals = f
            .aggregator
            .try_upsert_daily_summary("analyst", day(), &text("reviewed filings"))
            .expect("upsert");

        assert_eq!(totals.runs_completed, 2);
        assert_eq!(totals.api_calls, 4);
        assert_eq!(totals.total_tokens, 450);
        assert_eq!(totals.total_cost, Decimal::new(5_000, 6));
        assert_eq!(totals.errors, 1);
        // (2001 + 1000 + 1000 + 1000) / 4 = 1250.25
        assert_eq!(totals.avg_latency_ms, Some(1_250));
        assert!(f.sink.is_empty());

        let stored = f
            .aggregator
            .summary("analyst", day())
            .expect("read")
            .expect("row exists");
        assert_eq!(stored.totals, totals);
        assert_eq!(stored.text.what_i_did.as_deref(), Some("reviewed filings"));
    }

    #[test]
    fn repeated_upserts_yield_identical_numbers() {
        let f = fixture();
        f.ledger.record(&usage("analyst", Some("run_1"), at(2026, 3, 2, 9), 1_234));
        f.ledger.record(&usage("analyst", Some("run_2"), at(2026, 3, 2, 15), 4_321));

        f.aggregator.upsert_daily_summary("analyst", day(), &text("first"));
        let first = f.aggregator.summary("analyst", day()).expect("read").expect("row");
        f.aggregator.upsert_daily_summary("analyst", day(), &text("first"));
        let second = f.aggregator.summary("analyst", day()).expect("read").expect("row");

        assert_eq!(first.totals, second.totals);
        assert_eq!(first.created_at, second.created_at);
        assert!(f.sink.is_empty());
    }

    #[test]
    fn later_write_recomputes_numbers_and_replaces_text() {
        let f = fixture();
        f.ledger.record(&usage("analyst", Some("run_1"), at(2026, 3, 2, 9), 1_000));
        f.aggregator.upsert_daily_summary(
            "analyst",
            day(),
            &SummaryText {
                what_i_did: Some("morning".into()),
                blockers: Some("rate limits".into()),
                ..SummaryText::default()
            },
        );

        f.ledger.record(&usage("analyst", Some("run_2"), at(2026, 3, 2, 18), 2_000));
        f.aggregator.upsert_daily_summary("analyst", day(), &text("evening"));

        let stored = f.aggregator.summary("analyst", day()).expect("read").expect("row");
        assert_eq!(stored.totals.api_calls, 2);
        assert_eq!(stored.totals.runs_completed, 2);
        assert_eq!(stored.totals.total_cost, Decimal::new(3_000, 6));
        assert_eq!(stored.text.what_i_did.as_deref(), Some("evening"));
        assert_eq!(stored.text.blockers, None);

        let all = f.aggregator.summaries_on(day()).expect("list");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn day_without_calls_has_zero_totals() {
        let f = fixture();
        let totals = f
            .aggregator
            .try_upsert_daily_summary("idle", day(), &SummaryText::default())
            .expect("upsert");
        assert_eq!(totals, ActivityTotals::default());
    }

    #[test]
    fn storage_failure_is_reported_not_raised() {
        let tmp = TempDir::new().expect("tempdir");
        let sink = Arc::new(MemorySink::default());
        let aggregator = ActivityAggregator::new(tmp.path().join("bare.sqlite"), sink.clone());

        aggregator.upsert_daily_summary("analyst", day(), &text("x"));

        let failures = sink.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].operation, LedgerOperation::UpsertDailySummary);
        assert_eq!(failures[0].agent, "analyst");
    }
}
