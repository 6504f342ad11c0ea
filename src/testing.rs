//! Row builders shared by the ledger, activity and report tests.

use crate::cost::usd_from_micros;
use crate::models::{CostBreakdown, TokenUsage, UsageRecord};
use chrono::{DateTime, Duration, TimeZone, Utc};

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid test timestamp")
}

/// A successful call completed at `completed`, one second long, whose whole
/// cost of `cost_micros` is input cost.
pub fn usage(
    agent: &str,
    run_id: Option<&str>,
    completed: DateTime<Utc>,
    cost_micros: i64,
) -> UsageRecord {
    let cost = usd_from_micros(cost_micros);
    UsageRecord {
        agent_name: agent.to_string(),
        agent_id: agent.to_string(),
        agent_role: None,
        run_id: run_id.map(str::to_string),
        ticker: Some("AAPL".into()),
        triggered_by: "user_analysis".into(),
        api_provider: "anthropic".into(),
        api_endpoint: Some("https://api.anthropic.com/v1/messages".into()),
        model: "claude-sonnet-4-6".into(),
        tokens: TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            ..TokenUsage::default()
        },
        cost: CostBreakdown {
            input_cost: cost,
            total_cost: cost,
            ..CostBreakdown::default()
        },
        request_started_at: completed - Duration::seconds(1),
        request_completed_at: completed,
        latency_ms: 1_000,
        request_id: Some("req_test".into()),
        http_status_code: Some(200),
        retry_count: 0,
        is_error: false,
        error_type: None,
        error_message: None,
        environment: "test".into(),
        app_version: "0.0.0".into(),
    }
}

/// A failed call: zero tokens, zero cost, error fields set.
pub fn failed(agent: &str, run_id: Option<&str>, completed: DateTime<Utc>) -> UsageRecord {
    let mut row = usage(agent, run_id, completed, 0);
    row.tokens = TokenUsage::default();
    row.is_error = true;
    row.error_type = Some("rate_limited".into());
    row.error_message = Some("slow down".into());
    row.http_status_code = Some(429);
    row.retry_count = 2;
    row
}
