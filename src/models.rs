use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Raw token counts reported for one call. `thinking_tokens` is an estimate
/// derived from response text and is never provider-confirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub estimated_thinking_tokens: u64,
}

impl TokenUsage {
    pub fn uncached_input_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_sub(self.cache_read_tokens)
            .saturating_sub(self.cache_write_tokens)
    }

    pub fn response_tokens(&self) -> u64 {
        self.output_tokens
            .saturating_sub(self.estimated_thinking_tokens)
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Per-call cost in USD. Every component is rounded to 6 decimal places and
/// `total_cost` is the exact sum of the rounded components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub thinking_cost: Decimal,
    pub total_cost: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Partial,
    None,
}

impl CacheStatus {
    pub fn from_tokens(cache_read: u64, cache_write: u64) -> Self {
        match (cache_read > 0, cache_write > 0) {
            (true, false) => CacheStatus::Hit,
            (false, true) => CacheStatus::Miss,
            (true, true) => CacheStatus::Partial,
            (false, false) => CacheStatus::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Partial => "partial",
            CacheStatus::None => "none",
        }
    }
}

impl FromStr for CacheStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "hit" => Ok(CacheStatus::Hit),
            "miss" => Ok(CacheStatus::Miss),
            "partial" => Ok(CacheStatus::Partial),
            "none" => Ok(CacheStatus::None),
            other => Err(format!("unknown cache status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Premium,
    Standard,
    Economy,
}

impl ModelTier {
    /// Classifies by model family name; anything unrecognised is `Standard`.
    pub fn from_model(model: &str) -> Self {
        let model = model.to_ascii_lowercase();
        if model.contains("opus") {
            ModelTier::Premium
        } else if model.contains("sonnet") {
            ModelTier::Standard
        } else if model.contains("haiku") {
            ModelTier::Economy
        } else {
            ModelTier::Standard
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Premium => "premium",
            ModelTier::Standard => "standard",
            ModelTier::Economy => "economy",
        }
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "premium" => Ok(ModelTier::Premium),
            "standard" => Ok(ModelTier::Standard),
            "economy" => Ok(ModelTier::Economy),
            other => Err(format!("unknown model tier '{other}'")),
        }
    }
}

/// Who is making a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    pub id: String,
    pub role: Option<String>,
}

impl AgentIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// What a call is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSubject {
    pub run_id: Option<String>,
    pub ticker: Option<String>,
    pub triggered_by: String,
}

impl Default for CallSubject {
    fn default() -> Self {
        Self {
            run_id: None,
            ticker: None,
            triggered_by: "user_analysis".into(),
        }
    }
}

/// One ledger row as written by a caller. Cache status, model tier and the
/// created date are derived by the ledger at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub agent_name: String,
    pub agent_id: String,
    pub agent_role: Option<String>,

    pub run_id: Option<String>,
    pub ticker: Option<String>,
    pub triggered_by: String,

    pub api_provider: String,
    pub api_endpoint: Option<String>,
    pub model: String,

    pub tokens: TokenUsage,
    pub cost: CostBreakdown,

    pub request_started_at: DateTime<Utc>,
    pub request_completed_at: DateTime<Utc>,
    pub latency_ms: u64,

    pub request_id: Option<String>,
    pub http_status_code: Option<u16>,
    pub retry_count: u32,

    pub is_error: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,

    pub environment: String,
    pub app_version: String,
}

impl UsageRecord {
    pub fn cache_status(&self) -> CacheStatus {
        CacheStatus::from_tokens(self.tokens.cache_read_tokens, self.tokens.cache_write_tokens)
    }

    pub fn model_tier(&self) -> ModelTier {
        ModelTier::from_model(&self.model)
    }

    pub fn created_date(&self) -> NaiveDate {
        self.request_completed_at.date_naive()
    }
}

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUsageRecord {
    pub id: i64,
    #[serde(flatten)]
    pub record: UsageRecord,
    pub cache_status: CacheStatus,
    pub model_tier: ModelTier,
    pub created_date: NaiveDate,
}

/// Free text an agent supplies at the end of its run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryText {
    pub what_i_did: Option<String>,
    pub wins: Option<String>,
    pub losses: Option<String>,
    pub struggles: Option<String>,
    pub blockers: Option<String>,
}

/// Numeric part of a daily summary; always recomputed from the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityTotals {
    pub runs_completed: u64,
    pub api_calls: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub errors: u64,
    pub avg_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyActivitySummary {
    pub day: NaiveDate,
    pub agent_id: String,
    #[serde(flatten)]
    pub text: SummaryText,
    #[serde(flatten)]
    pub totals: ActivityTotals,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
