use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    Layered(#[from] config::ConfigError),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Failure classes reported by the provider transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    RateLimited,
    RequestTimeout,
    ProviderInternal,
    BadRequest,
    Authentication,
    ContentPolicy,
    Connection,
    InvalidResponse,
}

impl ProviderErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::RequestTimeout
                | ProviderErrorKind::ProviderInternal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::RequestTimeout => "request_timeout",
            ProviderErrorKind::ProviderInternal => "provider_internal",
            ProviderErrorKind::BadRequest => "bad_request",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::ContentPolicy => "content_policy",
            ProviderErrorKind::Connection => "connection",
            ProviderErrorKind::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed attempt, as seen by the transport.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

/// Terminal outcome of a gateway call that did not succeed.
#[derive(Debug, Clone, Error)]
#[error("provider call failed after {attempts} attempt(s) ({kind}): {message}")]
pub struct GatewayError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub attempts: u32,
    pub duration_ms: u64,
}
