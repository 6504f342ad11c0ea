use agent_meter::activity::ActivityAggregator;
use agent_meter::agent::{Agent, AgentContext, PromptAgent};
use agent_meter::config::{
    db_path, delete_api_key, ensure_initialized, load_config, normalize_provider_name,
    set_api_key, AppConfig,
};
use agent_meter::error::AppError;
use agent_meter::gateway::CallRequest;
use agent_meter::ledger::UsageLedger;
use agent_meter::models::{AgentIdentity, CallSubject, StoredUsageRecord, SummaryText};
use agent_meter::pricing::PricingCatalog;
use agent_meter::providers::Message;
use agent_meter::reports::{BillingPeriod, Reports};
use agent_meter::service::{build_transport, MeteredClient};
use agent_meter::storage::{ensure_schema, table_row_counts};
use agent_meter::telemetry::{init_tracing, FailureSink, TracingSink};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_RUN_PROMPT: &str = "Give a concise investment analysis of {ticker}.";

#[derive(Debug, Parser)]
#[command(name = "agent-meter")]
#[command(about = "Metered LLM calls with a durable usage ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create config, data directory and ledger schema.
    Init,
    SetKey {
        #[arg(long, default_value = "anthropic")]
        provider: String,
        #[arg(long)]
        api_key: String,
    },
    ClearKey {
        #[arg(long, default_value = "anthropic")]
        provider: String,
    },
    /// Show the effective pricing catalog.
    Pricing,
    /// Make one metered call and print the reply.
    Invoke {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        ticker: Option<String>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        max_tokens: Option<u32>,
        #[arg(long)]
        thinking: bool,
        #[arg(long)]
        thinking_budget: Option<u32>,
    },
    /// Run a prompt agent for a ticker and file its daily summary.
    Run {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        ticker: String,
        #[arg(long, default_value = DEFAULT_RUN_PROMPT)]
        prompt: String,
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Recompute and store an agent's daily summary.
    Summarize {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        what_i_did: Option<String>,
        #[arg(long)]
        wins: Option<String>,
        #[arg(long)]
        losses: Option<String>,
        #[arg(long)]
        struggles: Option<String>,
        #[arg(long)]
        blockers: Option<String>,
    },
    Report {
        #[command(subcommand)]
        kind: ReportKind,
        #[arg(long, global = true)]
        json: bool,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Subcommand)]
enum ReportKind {
    /// Spend per day for the month containing --date.
    Daily {
        #[arg(long)]
        date: Option<String>,
    },
    /// Spend per agent and model for the month containing --date.
    Agents {
        #[arg(long)]
        date: Option<String>,
    },
    /// Month-to-date spend against the configured budget.
    Budget {
        #[arg(long)]
        date: Option<String>,
    },
}

fn parse_date(input: Option<&str>) -> Result<NaiveDate, AppError> {
    match input {
        None => Ok(Utc::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|_| {
            AppError::Config(format!("Invalid date '{raw}'. Use YYYY-MM-DD."))
        }),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn opt_field(raw: Option<&str>) -> String {
    raw.map(csv_field).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn ledger_path(cfg: &AppConfig) -> Result<PathBuf, AppError> {
    let path = db_path(cfg)?;
    ensure_schema(&path)?;
    Ok(path)
}

fn metered_client(cfg: &AppConfig, sink: Arc<dyn FailureSink>) -> Result<MeteredClient, AppError> {
    ledger_path(cfg)?;
    MeteredClient::from_config(cfg, build_transport(cfg)?, sink)
}

const CSV_HEADER: &str = "id,created_date,agent_name,run_id,ticker,model,model_tier,\
input_tokens,output_tokens,thinking_tokens,cache_read_tokens,cache_write_tokens,cache_status,\
input_cost,output_cost,thinking_cost,total_cost,latency_ms,is_error,error_type";

fn csv_row(row: &StoredUsageRecord) -> String {
    let r = &row.record;
    [
        row.id.to_string(),
        row.created_date.to_string(),
        csv_field(&r.agent_name),
        opt_field(r.run_id.as_deref()),
        opt_field(r.ticker.as_deref()),
        csv_field(&r.model),
        row.model_tier.as_str().to_string(),
        r.tokens.input_tokens.to_string(),
        r.tokens.output_tokens.to_string(),
        r.tokens.estimated_thinking_tokens.to_string(),
        r.tokens.cache_read_tokens.to_string(),
        r.tokens.cache_write_tokens.to_string(),
        row.cache_status.as_str().to_string(),
        r.cost.input_cost.to_string(),
        r.cost.output_cost.to_string(),
        r.cost.thinking_cost.to_string(),
        r.cost.total_cost.to_string(),
        r.latency_ms.to_string(),
        r.is_error.to_string(),
        opt_field(r.error_type.as_deref()),
    ]
    .join(",")
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    ensure_initialized()?;
    let cfg = load_config()?;
    init_tracing(&cfg.log_level);
    let sink: Arc<dyn FailureSink> = Arc::new(TracingSink);

    match cli.command {
        Commands::Init => {
            let db = ledger_path(&cfg)?;
            println!("Initialized agent-meter config and ledger at {}.", db.display());
            for (table, rows) in table_row_counts(&db)? {
                println!("  {table}: {rows} rows");
            }
        }
        Commands::SetKey { provider, api_key } => {
            let provider = normalize_provider_name(&provider);
            set_api_key(&provider, &api_key)?;
            println!("API key for '{provider}' stored.");
        }
        Commands::ClearKey { provider } => {
            let provider = normalize_provider_name(&provider);
            delete_api_key(&provider)?;
            println!("API key for '{provider}' removed.");
        }
        Commands::Pricing => {
            let catalog = PricingCatalog::with_overrides(&cfg.pricing_overrides);
            println!("model,input_per_1m,output_per_1m,cache_write_per_1m,cache_read_per_1m");
            for entry in catalog.entries() {
                let marker = if entry.model_id == catalog.fallback().model_id {
                    " (fallback)"
                } else {
                    ""
                };
                println!(
                    "{}{},{},{},{},{}",
                    csv_field(&entry.model_id),
                    marker,
                    entry.input_per_million(),
                    entry.output_per_million(),
                    entry.cache_write_per_million(),
                    entry.cache_read_per_million(),
                );
            }
        }
        Commands::Invoke {
            agent,
            prompt,
            model,
            system,
            ticker,
            run_id,
            max_tokens,
            thinking,
            thinking_budget,
        } => {
            let client = metered_client(&cfg, sink)?;
            let model = model.unwrap_or_else(|| cfg.model_for(&agent).to_string());
            let mut request = CallRequest::new(model, vec![Message::user(prompt)]);
            if let Some(system) = system {
                request = request.with_system(system);
            }
            if let Some(max_tokens) = max_tokens {
                request = request.with_max_tokens(max_tokens);
            }
            if thinking || thinking_budget.is_some() {
                request = request.with_thinking(thinking_budget);
            }
            let subject = CallSubject {
                run_id,
                ticker,
                ..CallSubject::default()
            };

            let response = client
                .invoke(&AgentIdentity::new(agent), &subject, request)
                .await?;
            println!("{}", response.text());
            eprintln!(
                "model={} input_tokens={} output_tokens={} thinking_tokens_est={} cost_usd={} duration_ms={}",
                response.model,
                response.usage.input_tokens,
                response.usage.output_tokens,
                response.usage.estimated_thinking_tokens,
                response.cost.total_cost,
                response.duration_ms,
            );
        }
        Commands::Run {
            agent,
            ticker,
            prompt,
            run_id,
        } => {
            let client = Arc::new(metered_client(&cfg, sink.clone())?);
            let activity = ActivityAggregator::new(db_path(&cfg)?, sink);
            let model = cfg.model_for(&agent).to_string();
            let runner = PromptAgent::new(AgentIdentity::new(agent), model, prompt, client, activity);
            let run_id =
                run_id.unwrap_or_else(|| format!("run_{}", Utc::now().format("%Y%m%d%H%M%S")));

            let report = runner.run(&ticker, &AgentContext::new(run_id)).await?;
            println!("{}", report.output);
            eprintln!(
                "agent={} run_id={} cost_usd={} duration_ms={}",
                report.agent,
                report.run_id.as_deref().unwrap_or("-"),
                report.cost.total_cost,
                report.duration_ms,
            );
        }
        Commands::Summarize {
            agent,
            date,
            what_i_did,
            wins,
            losses,
            struggles,
            blockers,
        } => {
            let day = parse_date(date.as_deref())?;
            let activity = ActivityAggregator::new(ledger_path(&cfg)?, sink);
            let text = SummaryText {
                what_i_did,
                wins,
                losses,
                struggles,
                blockers,
            };
            let totals = activity.try_upsert_daily_summary(&agent, day, &text)?;
            println!(
                "{day} {agent}: runs={} api_calls={} total_tokens={} total_cost={} errors={} avg_latency_ms={}",
                totals.runs_completed,
                totals.api_calls,
                totals.total_tokens,
                totals.total_cost,
                totals.errors,
                totals
                    .avg_latency_ms
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".into()),
            );
        }
        Commands::Report { kind, json } => {
            let reports = Reports::new(ledger_path(&cfg)?);
            match kind {
                ReportKind::Daily { date } => {
                    let period = BillingPeriod::month_of(parse_date(date.as_deref())?);
                    let rows = reports.daily_rollup(Some(period))?;
                    if json {
                        println!("{}", to_json(&rows)?);
                    } else {
                        println!("day,total_cost,api_calls,runs,cache_hits,premium_cost,standard_cost,economy_cost,anthropic_cost,google_cost,openai_cost,avg_latency_ms");
                        for r in rows {
                            println!(
                                "{},{},{},{},{},{},{},{},{},{},{},{}",
                                r.day,
                                r.total_cost,
                                r.api_calls,
                                r.runs,
                                r.cache_hits,
                                r.premium_cost,
                                r.standard_cost,
                                r.economy_cost,
                                r.anthropic_cost,
                                r.google_cost,
                                r.openai_cost,
                                r.avg_latency_ms.map(|v| v.to_string()).unwrap_or_default(),
                            );
                        }
                    }
                }
                ReportKind::Agents { date } => {
                    let period = BillingPeriod::month_of(parse_date(date.as_deref())?);
                    let rows = reports.cost_by_agent(period)?;
                    if json {
                        println!("{}", to_json(&rows)?);
                    } else {
                        println!("agent,model,tier,provider,calls,total_cost,errors,runs");
                        for r in rows {
                            println!(
                                "{},{},{},{},{},{},{},{}",
                                csv_field(&r.agent_name),
                                csv_field(&r.model),
                                r.model_tier,
                                r.api_provider,
                                r.call_count,
                                r.total_cost,
                                r.error_count,
                                r.runs_served,
                            );
                        }
                    }
                }
                ReportKind::Budget { date } => {
                    let today = parse_date(date.as_deref())?;
                    let projection = reports.budget_projection(
                        BillingPeriod::month_of(today),
                        today,
                        &cfg.budget,
                    )?;
                    if json {
                        println!("{}", to_json(&projection)?);
                    } else {
                        println!("period:          {}", projection.period);
                        println!("spend:           {}", projection.spend);
                        println!("budget:          {}", projection.budget);
                        println!("remaining:       {}", projection.remaining);
                        println!("avg daily spend: {}", projection.avg_daily_spend);
                        println!("projected spend: {}", projection.projected_spend);
                        println!("on track:        {}", projection.on_track);
                        println!("status:          {}", projection.status.as_str());
                    }
                }
            }
        }
        Commands::Export { format } => {
            let ledger = UsageLedger::new(ledger_path(&cfg)?, sink);
            if format.eq_ignore_ascii_case("json") {
                println!("{}", to_json(&ledger.records()?)?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!("{CSV_HEADER}");
                for row in ledger.records()? {
                    println!("{}", csv_row(&row));
                }
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_accepts_iso_days() {
        assert_eq!(
            parse_date(Some("2026-03-02")).expect("valid"),
            NaiveDate::from_ymd_opt(2026, 3, 2).expect("date")
        );
    }

    #[test]
    fn parse_date_rejects_other_formats() {
        let err = parse_date(Some("03/02/2026")).expect_err("expected validation error");
        assert!(err.to_string().contains("Use YYYY-MM-DD"));
    }

    #[test]
    fn csv_field_escapes_special_characters() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn csv_header_and_row_have_matching_widths() {
        assert_eq!(CSV_HEADER.split(',').count(), 20);
        assert_eq!(opt_field(None), "");
        assert_eq!(opt_field(Some("x,y")), "\"x,y\"");
    }
}
