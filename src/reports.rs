//! Read-only views over `usage_records`. Nothing here is stored; every
//! report is recomputed from the ledger when asked for.

use crate::config::BudgetSettings;
use crate::cost::{round_usd, usd_from_micros};
use crate::error::AppError;
use crate::storage::open_connection;
use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::{named_params, Row};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Inclusive date range that spend is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, AppError> {
        if end < start {
            return Err(AppError::Config(format!(
                "billing period ends ({end}) before it starts ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// The calendar month containing `day`.
    pub fn month_of(day: NaiveDate) -> Self {
        let start = day - Duration::days(i64::from(day.day0()));
        let end = day
            .iter_days()
            .take_while(|d| d.month() == day.month())
            .last()
            .unwrap_or(day);
        Self { start, end }
    }

    pub fn days(&self) -> u32 {
        u32::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyCostRow {
    pub day: NaiveDate,
    pub total_cost: Decimal,
    pub api_calls: u64,
    pub runs: u64,
    pub cache_hits: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub cached_tokens: u64,
    pub premium_cost: Decimal,
    pub standard_cost: Decimal,
    pub economy_cost: Decimal,
    pub anthropic_cost: Decimal,
    pub google_cost: Decimal,
    pub openai_cost: Decimal,
    pub avg_cost_per_call: Decimal,
    pub avg_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentCostRow {
    pub agent_name: String,
    pub model: String,
    pub model_tier: String,
    pub api_provider: String,
    pub call_count: u64,
    pub total_cost: Decimal,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub cached_tokens: u64,
    pub avg_latency_ms: Option<u64>,
    pub error_count: u64,
    pub runs_served: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
}

impl BudgetStatus {
    pub fn classify(spend: Decimal, settings: &BudgetSettings) -> Self {
        let budget = settings.monthly_budget_usd;
        if spend >= budget * settings.critical_ratio {
            BudgetStatus::Critical
        } else if spend >= budget * settings.warning_ratio {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Healthy
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BudgetStatus::Healthy => "HEALTHY",
            BudgetStatus::Warning => "WARNING",
            BudgetStatus::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetProjection {
    pub period: BillingPeriod,
    pub budget: Decimal,
    pub spend: Decimal,
    pub remaining: Decimal,
    pub total_calls: u64,
    pub total_runs: u64,
    pub days_with_activity: u32,
    pub avg_daily_spend: Decimal,
    pub days_in_period: u32,
    pub days_remaining: u32,
    pub projected_spend: Decimal,
    pub on_track: bool,
    pub status: BudgetStatus,
}

fn count(raw: i64) -> u64 {
    u64::try_from(raw).unwrap_or(0)
}

fn parse_day(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(idx)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub struct Reports {
    db_path: PathBuf,
}

impl Reports {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Per-day spend over successful calls, newest day first.
    pub fn daily_rollup(&self, period: Option<BillingPeriod>) -> Result<Vec<DailyCostRow>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let (from, to) = match period {
            Some(p) => (p.start.to_string(), p.end.to_string()),
            None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
        };
        let mut stmt = conn.prepare(
            "SELECT created_date,
                    COALESCE(SUM(total_cost_micros), 0),
                    COUNT(*),
                    COUNT(DISTINCT run_id),
                    SUM(CASE WHEN prompt_cache_status = 'hit' THEN 1 ELSE 0 END),
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(thinking_tokens), 0),
                    COALESCE(SUM(input_cached_tokens), 0),
                    SUM(CASE WHEN model_tier = 'premium'  THEN total_cost_micros ELSE 0 END),
                    SUM(CASE WHEN model_tier = 'standard' THEN total_cost_micros ELSE 0 END),
                    SUM(CASE WHEN model_tier = 'economy'  THEN total_cost_micros ELSE 0 END),
                    CAST(ROUND(AVG(latency_ms)) AS INTEGER),
                    SUM(CASE WHEN api_provider = 'anthropic' THEN total_cost_micros ELSE 0 END),
                    SUM(CASE WHEN api_provider = 'google'    THEN total_cost_micros ELSE 0 END),
                    SUM(CASE WHEN api_provider = 'openai'    THEN total_cost_micros ELSE 0 END)
             FROM usage_records
             WHERE is_error = 0 AND created_date BETWEEN :from AND :to
             GROUP BY created_date
             ORDER BY created_date DESC",
        )?;
        let rows = stmt
            .query_map(named_params! { ":from": from, ":to": to }, |row| {
                let api_calls = count(row.get(2)?);
                let total_micros: i64 = row.get(1)?;
                let total_cost = usd_from_micros(total_micros);
                let avg_latency: Option<i64> = row.get(12)?;
                Ok(DailyCostRow {
                    day: parse_day(row, 0)?,
                    total_cost,
                    api_calls,
                    runs: count(row.get(3)?),
                    cache_hits: count(row.get(4)?),
                    input_tokens: count(row.get(5)?),
                    output_tokens: count(row.get(6)?),
                    thinking_tokens: count(row.get(7)?),
                    cached_tokens: count(row.get(8)?),
                    premium_cost: usd_from_micros(row.get(9)?),
                    standard_cost: usd_from_micros(row.get(10)?),
                    economy_cost: usd_from_micros(row.get(11)?),
                    anthropic_cost: usd_from_micros(row.get(13)?),
                    google_cost: usd_from_micros(row.get(14)?),
                    openai_cost: usd_from_micros(row.get(15)?),
                    avg_cost_per_call: if api_calls == 0 {
                        Decimal::ZERO
                    } else {
                        round_usd(total_cost / Decimal::from(api_calls))
                    },
                    avg_latency_ms: avg_latency.map(count),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Spend per (agent, model, tier, provider) within `period`, most
    /// expensive first. Error rows count towards `error_count`.
    pub fn cost_by_agent(&self, period: BillingPeriod) -> Result<Vec<AgentCostRow>, AppError> {
        let conn = open_connection(&self.db_path)?;
        let mut stmt = conn.prepare(
            "SELECT agent_name, model, model_tier, api_provider,
                    COUNT(*),
                    COALESCE(SUM(total_cost_micros), 0) AS cost,
                    COALESCE(SUM(input_tokens), 0),
                    COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(thinking_tokens), 0),
                    COALESCE(SUM(input_cached_tokens), 0),
                    CAST(ROUND(AVG(latency_ms)) AS INTEGER),
                    SUM(is_error),
                    COUNT(DISTINCT run_id)
             FROM usage_records
             WHERE created_date BETWEEN :from AND :to
             GROUP BY agent_name, model, model_tier, api_provider
             ORDER BY cost DESC, agent_name, model",
        )?;
        let rows = stmt
            .query_map(
                named_params! {
                    ":from": period.start.to_string(),
                    ":to": period.end.to_string(),
                },
                agent_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Spend so far in `period` as of `today`, projected over the whole
    /// period as `avg_daily_spend * days_in_period`. Error rows are ignored.
    pub fn budget_projection(
        &self,
        period: BillingPeriod,
        today: NaiveDate,
        settings: &BudgetSettings,
    ) -> Result<BudgetProjection, AppError> {
        let conn = open_connection(&self.db_path)?;
        let (spend_micros, days_with_activity, total_calls, total_runs): (i64, i64, i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(total_cost_micros), 0),
                        COUNT(DISTINCT created_date),
                        COUNT(*),
                        COUNT(DISTINCT run_id)
                 FROM usage_records
                 WHERE is_error = 0 AND created_date BETWEEN :from AND :to",
                named_params! {
                    ":from": period.start.to_string(),
                    ":to": period.end.to_string(),
                },
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
        Ok(project(
            period,
            today,
            settings,
            usd_from_micros(spend_micros),
            u32::try_from(days_with_activity).unwrap_or(u32::MAX),
            count(total_calls),
            count(total_runs),
        ))
    }
}

fn agent_row(row: &Row<'_>) -> rusqlite::Result<AgentCostRow> {
    let avg_latency: Option<i64> = row.get(10)?;
    let errors: Option<i64> = row.get(11)?;
    Ok(AgentCostRow {
        agent_name: row.get(0)?,
        model: row.get(1)?,
        model_tier: row.get(2)?,
        api_provider: row.get(3)?,
        call_count: count(row.get(4)?),
        total_cost: usd_from_micros(row.get(5)?),
        input_tokens: count(row.get(6)?),
        output_tokens: count(row.get(7)?),
        thinking_tokens: count(row.get(8)?),
        cached_tokens: count(row.get(9)?),
        avg_latency_ms: avg_latency.map(count),
        error_count: count(errors.unwrap_or(0)),
        runs_served: count(row.get(12)?),
    })
}

fn project(
    period: BillingPeriod,
    today: NaiveDate,
    settings: &BudgetSettings,
    spend: Decimal,
    days_with_activity: u32,
    total_calls: u64,
    total_runs: u64,
) -> BudgetProjection {
    let avg_daily_spend = if days_with_activity == 0 {
        Decimal::ZERO
    } else {
        round_usd(spend / Decimal::from(days_with_activity))
    };
    let days_in_period = period.days();
    let projected_spend = round_usd(avg_daily_spend * Decimal::from(days_in_period));
    let days_remaining = if today < period.start {
        days_in_period
    } else {
        u32::try_from((period.end - today).num_days().max(0)).unwrap_or(0)
    };
    let budget = settings.monthly_budget_usd;

    BudgetProjection {
        period,
        budget,
        spend,
        remaining: budget - spend,
        total_calls,
        total_runs,
        days_with_activity,
        avg_daily_spend,
        days_in_period,
        days_remaining,
        projected_spend,
        on_track: projected_spend <= budget,
        status: BudgetStatus::classify(spend, settings),
    }
}
