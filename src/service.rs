use crate::config::{db_path, get_api_key, normalize_provider_name, AppConfig};
use crate::cost::CostCalculator;
use crate::error::{AppError, GatewayError};
use crate::gateway::{CallGateway, CallOutcome, CallRequest, GatewaySettings, RetryPolicy};
use crate::ledger::UsageLedger;
use crate::models::{AgentIdentity, CallSubject, CostBreakdown, TokenUsage, UsageRecord};
use crate::pricing::PricingCatalog;
use crate::providers::anthropic::AnthropicTransport;
use crate::providers::{joined_text, ContentBlock, Transport};
use crate::telemetry::FailureSink;
use crate::APP_VERSION;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What an agent gets back from a metered call.
#[derive(Debug, Clone, PartialEq)]
pub struct MeteredResponse {
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub duration_ms: u64,
    pub request_id: Option<String>,
    pub attempts: u32,
}

impl MeteredResponse {
    pub fn text(&self) -> String {
        joined_text(&self.content)
    }
}

/// Builds the transport for the configured provider.
pub fn build_transport(cfg: &AppConfig) -> Result<Arc<dyn Transport>, AppError> {
    let provider = normalize_provider_name(&cfg.api_provider);
    match provider.as_str() {
        "anthropic" => {
            let api_key = get_api_key(&provider)?;
            let transport = AnthropicTransport::new(
                api_key,
                cfg.base_url.clone(),
                Duration::from_secs(cfg.request_timeout_secs),
            )?;
            Ok(Arc::new(transport))
        }
        _ => Err(AppError::Config(format!(
            "Unsupported provider '{provider}'."
        ))),
    }
}

/// Gateway, pricing and ledger composed into one call path: every call
/// that reaches a terminal outcome leaves exactly one ledger row.
pub struct MeteredClient {
    gateway: CallGateway,
    calculator: CostCalculator,
    ledger: UsageLedger,
    environment: String,
}

impl MeteredClient {
    pub fn new(gateway: CallGateway, calculator: CostCalculator, ledger: UsageLedger) -> Self {
        Self {
            gateway,
            calculator,
            ledger,
            environment: "production".into(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn from_config(
        cfg: &AppConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn FailureSink>,
    ) -> Result<Self, AppError> {
        let gateway = CallGateway::new(
            transport,
            RetryPolicy::from(&cfg.retry),
            GatewaySettings::from(cfg),
        );
        let calculator =
            CostCalculator::new(Arc::new(PricingCatalog::with_overrides(&cfg.pricing_overrides)));
        let ledger = UsageLedger::new(db_path(cfg)?, sink);
        Ok(Self::new(gateway, calculator, ledger).with_environment(cfg.environment.clone()))
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Runs one call through the gateway, prices it and ledgers the outcome.
    /// Only provider failures are returned; ledger failures go to the sink.
    pub async fn invoke(
        &self,
        agent: &AgentIdentity,
        subject: &CallSubject,
        request: CallRequest,
    ) -> Result<MeteredResponse, GatewayError> {
        self.invoke_with_ledger_day(agent, subject, request).await.1
    }

    /// Same as [`MeteredClient::invoke`], also returning the `created_date`
    /// the ledger row was filed under.
    pub async fn invoke_with_ledger_day(
        &self,
        agent: &AgentIdentity,
        subject: &CallSubject,
        request: CallRequest,
    ) -> (NaiveDate, Result<MeteredResponse, GatewayError>) {
        let started_at = Utc::now();
        match self.gateway.invoke(&request).await {
            Ok(outcome) => {
                let cost = self.calculator.compute_usage(&request.model, &outcome.usage);
                info!(
                    agent = %agent.name,
                    model = %request.model,
                    ticker = subject.ticker.as_deref().unwrap_or("-"),
                    input_tokens = outcome.usage.input_tokens,
                    output_tokens = outcome.usage.output_tokens,
                    thinking_tokens_est = outcome.usage.estimated_thinking_tokens,
                    cache_read_tokens = outcome.usage.cache_read_tokens,
                    cost_usd = %cost.total_cost,
                    duration_ms = outcome.duration_ms,
                    "metered call complete"
                );
                let record = self.success_record(agent, subject, &request, &outcome, cost, started_at);
                self.ledger.record(&record);

                let response = MeteredResponse {
                    model: request.model,
                    content: outcome.content,
                    usage: outcome.usage,
                    cost,
                    duration_ms: outcome.duration_ms,
                    request_id: outcome.request_id,
                    attempts: outcome.attempts,
                };
                (record.created_date(), Ok(response))
            }
            Err(err) => {
                warn!(
                    agent = %agent.name,
                    model = %request.model,
                    kind = %err.kind,
                    attempts = err.attempts,
                    duration_ms = err.duration_ms,
                    error = %err.message,
                    "metered call failed"
                );
                let record = self.error_record(agent, subject, &request, &err, started_at);
                self.ledger.record(&record);
                (record.created_date(), Err(err))
            }
        }
    }

    fn base_record(
        &self,
        agent: &AgentIdentity,
        subject: &CallSubject,
        model: &str,
        started_at: DateTime<Utc>,
        latency_ms: u64,
    ) -> UsageRecord {
        let latency = chrono::Duration::milliseconds(i64::try_from(latency_ms).unwrap_or(i64::MAX));
        UsageRecord {
            agent_name: agent.name.clone(),
            agent_id: agent.id.clone(),
            agent_role: agent.role.clone(),
            run_id: subject.run_id.clone(),
            ticker: subject.ticker.clone(),
            triggered_by: subject.triggered_by.clone(),
            api_provider: self.gateway.provider().to_string(),
            api_endpoint: Some(self.gateway.endpoint()),
            model: model.to_string(),
            tokens: TokenUsage::default(),
            cost: CostBreakdown::default(),
            request_started_at: started_at,
            request_completed_at: started_at
                .checked_add_signed(latency)
                .unwrap_or(started_at),
            latency_ms,
            request_id: None,
            http_status_code: None,
            retry_count: 0,
            is_error: false,
            error_type: None,
            error_message: None,
            environment: self.environment.clone(),
            app_version: APP_VERSION.to_string(),
        }
    }

    fn success_record(
        &self,
        agent: &AgentIdentity,
        subject: &CallSubject,
        request: &CallRequest,
        outcome: &CallOutcome,
        cost: CostBreakdown,
        started_at: DateTime<Utc>,
    ) -> UsageRecord {
        UsageRecord {
            tokens: outcome.usage,
            cost,
            request_id: outcome.request_id.clone(),
            http_status_code: outcome.http_status,
            retry_count: outcome.attempts.saturating_sub(1),
            ..self.base_record(agent, subject, &request.model, started_at, outcome.duration_ms)
        }
    }

    fn error_record(
        &self,
        agent: &AgentIdentity,
        subject: &CallSubject,
        request: &CallRequest,
        err: &GatewayError,
        started_at: DateTime<Utc>,
    ) -> UsageRecord {
        UsageRecord {
            http_status_code: err.http_status,
            retry_count: err.attempts.saturating_sub(1),
            is_error: true,
            error_type: Some(err.kind.as_str().to_string()),
            error_message: Some(err.message.clone()),
            ..self.base_record(agent, subject, &request.model, started_at, err.duration_ms)
        }
    }
}
