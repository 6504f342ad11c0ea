use agent_meter::ledger::UsageLedger;
use agent_meter::models::{CostBreakdown, TokenUsage, UsageRecord};
use agent_meter::telemetry::MemorySink;
use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;

fn home_path(home: &TempDir) -> &Path {
    home.path()
}

fn bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_agent-meter")
}

fn run_cmd_with_env(home: &TempDir, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(bin_path());
    cmd.args(args)
        .env("AGENT_METER_HOME", home_path(home))
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("AGENT_METER_LOG");
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.output().expect("run agent-meter command")
}

fn run_cmd(home: &TempDir, args: &[&str]) -> Output {
    run_cmd_with_env(home, args, &[])
}

fn db_path(home: &TempDir) -> PathBuf {
    home.path().join("data").join("ledger.sqlite")
}

fn seed_usage_row(home: &TempDir, agent: &str, model: &str, day: u32, cost_micros: i64, is_error: bool) {
    let completed = Utc
        .with_ymd_and_hms(2026, 3, day, 12, 0, 0)
        .single()
        .expect("timestamp");
    let cost = Decimal::new(cost_micros, 6);
    let record = UsageRecord {
        agent_name: agent.into(),
        agent_id: agent.into(),
        agent_role: None,
        run_id: Some(format!("run_{day}")),
        ticker: Some("AAPL".into()),
        triggered_by: "user_analysis".into(),
        api_provider: "anthropic".into(),
        api_endpoint: None,
        model: model.into(),
        tokens: TokenUsage {
            input_tokens: 1_000,
            output_tokens: 200,
            ..TokenUsage::default()
        },
        cost: CostBreakdown {
            input_cost: cost,
            total_cost: cost,
            ..CostBreakdown::default()
        },
        request_started_at: completed,
        request_completed_at: completed,
        latency_ms: 800,
        request_id: None,
        http_status_code: Some(200),
        retry_count: 0,
        is_error,
        error_type: is_error.then(|| "rate_limited".to_string()),
        error_message: None,
        environment: "test".into(),
        app_version: "0.0.0".into(),
    };

    let sink = Arc::new(MemorySink::default());
    UsageLedger::new(db_path(home), sink.clone()).record(&record);
    assert!(sink.is_empty(), "seeding failed: {:?}", sink.failures());
}

#[test]
fn init_creates_config_data_and_ledger() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["init"]);
    assert!(output.status.success());

    assert!(home.path().join("config").join("config.toml").exists());
    assert!(db_path(&home).exists());

    let conn = Connection::open(db_path(&home)).expect("open sqlite");
    let tables: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('usage_records', 'daily_activity')",
            [],
            |row| row.get(0),
        )
        .expect("count tables");
    assert_eq!(tables, 2);
}

#[test]
fn init_is_idempotent() {
    let home = TempDir::new().expect("temp home");

    assert!(run_cmd(&home, &["init"]).status.success());
    let first = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after first init");

    assert!(run_cmd(&home, &["init"]).status.success());
    let second = fs::read_to_string(home.path().join("config").join("config.toml"))
        .expect("read config after second init");

    assert_eq!(first, second);
}

#[test]
fn pricing_lists_catalog_with_fallback() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["pricing"]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("claude-opus-4-6,5"));
    assert!(stdout.contains("claude-sonnet-4-6 (fallback),3"));
}

#[test]
fn invoke_rejects_unsupported_provider_from_env() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd_with_env(
        &home,
        &["invoke", "--agent", "manager", "--prompt", "hi"],
        &[("AGENT_METER__API_PROVIDER", "nope")],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported provider 'nope'"));
}

#[test]
fn export_csv_outputs_header_and_escaped_fields() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_usage_row(&home, "analyst,lead", "claude\"x", 2, 1_250_000, false);

    let output = run_cmd(&home, &["export", "--format", "csv"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("id,created_date,agent_name,run_id,ticker,model,model_tier"));
    assert!(stdout.contains("\"analyst,lead\",run_2,AAPL,\"claude\"\"x\",standard"));
    assert!(stdout.contains("1.250000"));
}

#[test]
fn export_json_outputs_valid_array() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_usage_row(&home, "manager", "claude-opus-4-6", 2, 39_600, false);

    let output = run_cmd(&home, &["export", "--format", "json"]);
    assert!(output.status.success());

    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    let arr = parsed.as_array().expect("json array");
    assert_eq!(arr.len(), 1);
    assert_eq!(arr[0]["agent_name"], "manager");
    assert_eq!(arr[0]["model_tier"], "premium");
    assert_eq!(arr[0]["created_date"], "2026-03-02");
}

#[test]
fn export_rejects_unknown_format() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["export", "--format", "xml"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unsupported export format"));
}

#[test]
fn summarize_recomputes_totals_from_ledger() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_usage_row(&home, "analyst", "claude-sonnet-4-6", 2, 10_000, false);
    seed_usage_row(&home, "analyst", "claude-sonnet-4-6", 2, 0, true);

    let args = [
        "summarize",
        "--agent",
        "analyst",
        "--date",
        "2026-03-02",
        "--what-i-did",
        "covered AAPL",
    ];
    let first = run_cmd(&home, &args);
    assert!(first.status.success());
    let second = run_cmd(&home, &args);
    assert!(second.status.success());

    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("api_calls=2"));
    assert!(stdout.contains("errors=1"));
    assert!(stdout.contains("total_cost=0.010000"));

    let conn = Connection::open(db_path(&home)).expect("open sqlite");
    let (rows, what): (i64, String) = conn
        .query_row(
            "SELECT COUNT(*), MAX(what_i_did) FROM daily_activity WHERE agent_id = 'analyst'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .expect("query summary");
    assert_eq!(rows, 1);
    assert_eq!(what, "covered AAPL");
}

#[test]
fn report_agents_json_orders_by_cost() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_usage_row(&home, "technical_analyst", "claude-haiku-4-5-20251001", 3, 2_000, false);
    seed_usage_row(&home, "manager", "claude-opus-4-6", 4, 90_000, false);

    let output = run_cmd(&home, &["report", "agents", "--date", "2026-03-15", "--json"]);
    assert!(output.status.success());
    let parsed: Value = serde_json::from_slice(&output.stdout).expect("valid json output");
    let arr = parsed.as_array().expect("json array");
    assert_eq!(arr.len(), 2);
    assert_eq!(arr[0]["agent_name"], "manager");
    assert_eq!(arr[1]["model_tier"], "economy");
}

#[test]
fn report_budget_prints_status() {
    let home = TempDir::new().expect("temp home");
    assert!(run_cmd(&home, &["init"]).status.success());
    seed_usage_row(&home, "manager", "claude-opus-4-6", 1, 70_000_000, false);

    let output = run_cmd(&home, &["report", "budget", "--date", "2026-03-10"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("status:          WARNING"));
    assert!(stdout.contains("on track:        false"));
}

#[test]
fn report_rejects_invalid_date() {
    let home = TempDir::new().expect("temp home");
    let output = run_cmd(&home, &["report", "daily", "--date", "March"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid date 'March'. Use YYYY-MM-DD."));
}
