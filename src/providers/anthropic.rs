use crate::error::{AppError, ProviderError, ProviderErrorKind};
use crate::providers::{MessagesRequest, MessagesResponse, Transport, TransportResponse};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

const DEFAULT_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicTransport {
    client: Client,
    api_key: String,
    url: String,
}

impl AnthropicTransport {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: Self::resolve_messages_url(base_url),
        })
    }

    fn resolve_messages_url(base_url: Option<String>) -> String {
        let Some(base) = base_url else {
            return DEFAULT_MESSAGES_URL.to_string();
        };

        if let Ok(mut parsed) = url::Url::parse(&base) {
            let path = parsed.path().to_string();
            if path.is_empty() || path == "/" || path == "/v1" || path == "/v1/" {
                parsed.set_path("/v1/messages");
                return parsed.to_string();
            }
            if path.ends_with("/v1/messages") {
                return parsed.to_string();
            }
        }
        base
    }

    /// Pulls `error.type` and `error.message` out of an error body.
    fn error_details(body: &str) -> (Option<String>, String) {
        let Ok(value) = serde_json::from_str::<Value>(body) else {
            return (None, body.trim().to_string());
        };
        let error = value.get("error");
        let kind = error
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| body.trim().to_string());
        (kind, message)
    }

    fn classify_status(status: u16, error_type: Option<&str>, message: &str) -> ProviderErrorKind {
        match status {
            429 => return ProviderErrorKind::RateLimited,
            408 => return ProviderErrorKind::RequestTimeout,
            500..=599 => return ProviderErrorKind::ProviderInternal,
            _ => {}
        }

        match error_type {
            Some("rate_limit_error") => return ProviderErrorKind::RateLimited,
            Some("overloaded_error") | Some("api_error") => {
                return ProviderErrorKind::ProviderInternal
            }
            _ => {}
        }

        let lowered = message.to_ascii_lowercase();
        if (400..500).contains(&status)
            && (lowered.contains("policy") || lowered.contains("safety"))
        {
            return ProviderErrorKind::ContentPolicy;
        }

        match status {
            401 | 403 => ProviderErrorKind::Authentication,
            400..=499 => ProviderErrorKind::BadRequest,
            _ => ProviderErrorKind::InvalidResponse,
        }
    }

    fn classify_transport_error(err: &reqwest::Error) -> ProviderErrorKind {
        if err.is_timeout() {
            ProviderErrorKind::RequestTimeout
        } else if err.is_decode() {
            ProviderErrorKind::InvalidResponse
        } else {
            ProviderErrorKind::Connection
        }
    }
}

#[async_trait]
impl Transport for AnthropicTransport {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn send(&self, request: &MessagesRequest) -> Result<TransportResponse, ProviderError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::new(Self::classify_transport_error(&e), e.to_string()))?;

        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let text = response.text().await.map_err(|e| {
            ProviderError::new(Self::classify_transport_error(&e), e.to_string())
                .with_status(status)
        })?;

        if !(200..300).contains(&status) {
            let (error_type, message) = Self::error_details(&text);
            let kind = Self::classify_status(status, error_type.as_deref(), &message);
            return Err(ProviderError::new(kind, message).with_status(status));
        }

        let body: MessagesResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::InvalidResponse,
                format!("could not decode messages response: {e}"),
            )
            .with_status(status)
        })?;

        Ok(TransportResponse {
            request_id: request_id.or_else(|| Some(body.id.clone())),
            http_status: Some(status),
            body,
        })
    }
}
