//! Resilient, metered access to the provider's Messages endpoint.
//!
//! The gateway owns retry/backoff, wall-clock timing and token extraction.
//! It performs no persistence; pricing and ledgering are composed on top in
//! [`crate::service::MeteredClient`].

use crate::config::{AppConfig, PromptCachingSettings, RetrySettings};
use crate::error::{GatewayError, ProviderError};
use crate::models::TokenUsage;
use crate::providers::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, ThinkingConfig, ThinkingMode,
    Transport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Characters per token used to estimate thinking tokens from text.
const CHARS_PER_THINKING_TOKEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Sleep before the retry that follows failed attempt number `attempt`
    /// (1-based): `initial * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_tokens_per_call: u32,
    pub thinking_budget_tokens: u32,
    pub prompt_caching: PromptCachingSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_tokens_per_call: 4096,
            thinking_budget_tokens: 8_000,
            prompt_caching: PromptCachingSettings::default(),
        }
    }
}

impl From<&AppConfig> for GatewaySettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_tokens_per_call: cfg.max_tokens_per_call,
            thinking_budget_tokens: cfg.thinking_budget_tokens,
            prompt_caching: cfg.prompt_caching.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SystemPrompt {
    Text(String),
    /// Pre-built content blocks, sent as-is.
    Blocks(Vec<Value>),
}

/// What an agent asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<SystemPrompt>,
    pub max_tokens: Option<u32>,
    pub enable_thinking: bool,
    pub thinking_budget_tokens: Option<u32>,
}

impl CallRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            system: None,
            max_tokens: None,
            enable_thinking: false,
            thinking_budget_tokens: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(SystemPrompt::Text(system.into()));
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_thinking(mut self, budget_tokens: Option<u32>) -> Self {
        self.enable_thinking = true;
        self.thinking_budget_tokens = budget_tokens;
        self
    }
}

/// Result of one successful gateway call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    /// Caller-observed latency, retry sleeps included.
    pub duration_ms: u64,
    pub request_id: Option<String>,
    pub http_status: Option<u16>,
    pub attempts: u32,
}

/// Estimated thinking tokens: characters of thinking text divided by 4.
/// This is a heuristic, not a provider-reported count.
pub fn estimate_thinking_tokens(content: &[ContentBlock]) -> u64 {
    let chars: usize = content
        .iter()
        .map(|block| match block {
            ContentBlock::Thinking { thinking, .. } => thinking.chars().count(),
            _ => 0,
        })
        .sum();
    chars as u64 / CHARS_PER_THINKING_TOKEN
}

pub fn extract_usage(body: &MessagesResponse, thinking_requested: bool) -> TokenUsage {
    let estimated_thinking_tokens = if thinking_requested {
        estimate_thinking_tokens(&body.content)
    } else {
        0
    };
    TokenUsage {
        input_tokens: body.usage.input_tokens,
        output_tokens: body.usage.output_tokens,
        cache_read_tokens: body.usage.cache_read_input_tokens.unwrap_or(0),
        cache_write_tokens: body.usage.cache_creation_input_tokens.unwrap_or(0),
        estimated_thinking_tokens,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

pub struct CallGateway {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    settings: GatewaySettings,
}

impl CallGateway {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, settings: GatewaySettings) -> Self {
        Self {
            transport,
            policy,
            settings,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.transport.provider()
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    fn system_value(&self, system: &SystemPrompt) -> Value {
        match system {
            SystemPrompt::Text(text)
                if self.settings.prompt_caching.enabled
                    && text.chars().count() >= self.settings.prompt_caching.min_chars =>
            {
                json!([{
                    "type": "text",
                    "text": text,
                    "cache_control": { "type": "ephemeral" }
                }])
            }
            SystemPrompt::Text(text) => Value::String(text.clone()),
            SystemPrompt::Blocks(blocks) => Value::Array(blocks.clone()),
        }
    }

    pub fn build_request(&self, request: &CallRequest) -> MessagesRequest {
        let thinking = request.enable_thinking.then(|| ThinkingConfig {
            kind: ThinkingMode::Enabled,
            budget_tokens: request
                .thinking_budget_tokens
                .unwrap_or(self.settings.thinking_budget_tokens),
        });

        MessagesRequest {
            model: request.model.clone(),
            max_tokens: request
                .max_tokens
                .unwrap_or(self.settings.max_tokens_per_call),
            messages: request.messages.clone(),
            system: request.system.as_ref().map(|s| self.system_value(s)),
            thinking,
        }
    }

    /// Sends `request`, retrying rate-limit, timeout and provider-internal
    /// failures with exponential backoff. Any other failure, or running out
    /// of attempts, ends the call with a [`GatewayError`].
    pub async fn invoke(&self, request: &CallRequest) -> Result<CallOutcome, GatewayError> {
        let wire = self.build_request(request);
        let max_attempts = self.policy.max_attempts.max(1);
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.transport.send(&wire).await {
                Ok(response) => {
                    let duration_ms = elapsed_ms(started);
                    let usage = extract_usage(&response.body, request.enable_thinking);
                    debug!(
                        model = %wire.model,
                        attempt,
                        duration_ms,
                        "provider call succeeded"
                    );
                    return Ok(CallOutcome {
                        content: response.body.content,
                        usage,
                        duration_ms,
                        request_id: response.request_id,
                        http_status: response.http_status,
                        attempts: attempt,
                    });
                }
                Err(err) if err.kind.is_retryable() && attempt < max_attempts => {
                    let backoff = self.policy.backoff_after(attempt);
                    warn!(
                        model = %wire.model,
                        attempt,
                        max_attempts,
                        kind = %err.kind,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %err.message,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(self.terminal(err, attempt, started)),
            }
        }
    }

    fn terminal(&self, err: ProviderError, attempts: u32, started: Instant) -> GatewayError {
        GatewayError {
            kind: err.kind,
            message: err.message,
            http_status: err.http_status,
            attempts,
            duration_ms: elapsed_ms(started),
        }
    }
}
