use crate::activity::ActivityAggregator;
use crate::error::AppError;
use crate::gateway::CallRequest;
use crate::models::{AgentIdentity, CallSubject, CostBreakdown, SummaryText, TokenUsage};
use crate::providers::Message;
use crate::service::MeteredClient;
use async_trait::async_trait;
use std::sync::Arc;

/// Per-run inputs shared by every agent taking part in one analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentContext {
    pub run_id: Option<String>,
    pub triggered_by: String,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    fn subject(&self, ticker: &str) -> CallSubject {
        CallSubject {
            run_id: self.run_id.clone(),
            ticker: Some(ticker.to_string()),
            triggered_by: self.triggered_by.clone(),
        }
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self {
            run_id: None,
            triggered_by: CallSubject::default().triggered_by,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentReport {
    pub agent: String,
    pub ticker: String,
    pub run_id: Option<String>,
    pub model: String,
    pub output: String,
    pub usage: TokenUsage,
    pub cost: CostBreakdown,
    pub duration_ms: u64,
}

/// Something that analyses a ticker. Implementations own whatever metered
/// client and aggregator they need; nothing is inherited.
#[async_trait]
pub trait Agent: Send + Sync {
    fn identity(&self) -> &AgentIdentity;

    async fn run(&self, ticker: &str, ctx: &AgentContext) -> Result<AgentReport, AppError>;
}

/// An agent that fills a prompt template with the ticker, makes one metered
/// call and files its daily summary.
///
/// The summary is keyed by the identity's `name`, the column the aggregator
/// reads the ledger by, and filed under the day the call was ledgered.
pub struct PromptAgent {
    identity: AgentIdentity,
    model: String,
    system: Option<String>,
    template: String,
    thinking_budget: Option<Option<u32>>,
    client: Arc<MeteredClient>,
    activity: ActivityAggregator,
}

impl PromptAgent {
    /// `template` may contain `{ticker}`.
    pub fn new(
        identity: AgentIdentity,
        model: impl Into<String>,
        template: impl Into<String>,
        client: Arc<MeteredClient>,
        activity: ActivityAggregator,
    ) -> Self {
        Self {
            identity,
            model: model.into(),
            system: None,
            template: template.into(),
            thinking_budget: None,
            client,
            activity,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Requests extended thinking; `None` uses the configured budget.
    pub fn with_thinking(mut self, budget_tokens: Option<u32>) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    fn request(&self, ticker: &str) -> CallRequest {
        let prompt = self.template.replace("{ticker}", ticker);
        let mut request = CallRequest::new(self.model.clone(), vec![Message::user(prompt)]);
        if let Some(system) = &self.system {
            request = request.with_system(system.clone());
        }
        if let Some(budget) = self.thinking_budget {
            request = request.with_thinking(budget);
        }
        request
    }
}

#[async_trait]
impl Agent for PromptAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn run(&self, ticker: &str, ctx: &AgentContext) -> Result<AgentReport, AppError> {
        let (day, result) = self
            .client
            .invoke_with_ledger_day(&self.identity, &ctx.subject(ticker), self.request(ticker))
            .await;

        match result {
            Ok(response) => {
                let output = response.text();
                let headline = output.lines().find(|l| !l.trim().is_empty()).map(str::to_string);
                self.activity.upsert_daily_summary(
                    &self.identity.name,
                    day,
                    &SummaryText {
                        what_i_did: Some(format!("Analyzed {ticker} with {}", response.model)),
                        wins: headline,
                        ..SummaryText::default()
                    },
                );
                Ok(AgentReport {
                    agent: self.identity.name.clone(),
                    ticker: ticker.to_string(),
                    run_id: ctx.run_id.clone(),
                    model: response.model,
                    output,
                    usage: response.usage,
                    cost: response.cost,
                    duration_ms: response.duration_ms,
                })
            }
            Err(err) => {
                self.activity.upsert_daily_summary(
                    &self.identity.name,
                    day,
                    &SummaryText {
                        what_i_did: Some(format!("Attempted {ticker} with {}", self.model)),
                        blockers: Some(err.to_string()),
                        ..SummaryText::default()
                    },
                );
                Err(AppError::Gateway(err))
            }
        }
    }
}
