use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::{
    ContentBlock, MessagesRequest, MessagesResponse, ProviderUsage, Transport, TransportResponse,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays a fixed sequence of transport results and records every request.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, ProviderError>>>,
    repeat_last: bool,
    seen: Mutex<Vec<MessagesRequest>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<TransportResponse, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat_last: false,
            seen: Mutex::new(vec![]),
        }
    }

    /// Fails forever with `kind`.
    pub fn always_failing(kind: ProviderErrorKind) -> Self {
        Self {
            script: Mutex::new(VecDeque::from([Err(ProviderError::new(kind, "scripted"))])),
            repeat_last: true,
            seen: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().expect("seen lock").len()
    }

    pub fn requests(&self) -> Vec<MessagesRequest> {
        self.seen.lock().expect("seen lock").clone()
    }
}

pub fn ok_response(input: u64, output: u64, content: Vec<ContentBlock>) -> TransportResponse {
    TransportResponse {
        body: MessagesResponse {
            id: "msg_scripted".into(),
            model: "scripted".into(),
            content,
            stop_reason: Some("end_turn".into()),
            usage: ProviderUsage {
                input_tokens: input,
                output_tokens: output,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        },
        http_status: Some(200),
        request_id: Some("req_scripted".into()),
    }
}

pub fn text(text: &str) -> ContentBlock {
    ContentBlock::Text { text: text.into() }
}

pub fn failure(kind: ProviderErrorKind) -> ProviderError {
    ProviderError::new(kind, format!("scripted {kind}"))
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    fn endpoint(&self) -> String {
        "scripted://messages".into()
    }

    async fn send(&self, request: &MessagesRequest) -> Result<TransportResponse, ProviderError> {
        self.seen.lock().expect("seen lock").push(request.clone());
        let mut script = self.script.lock().expect("script lock");
        if self.repeat_last && script.len() == 1 {
            return script
                .front()
                .cloned()
                .unwrap_or_else(|| Err(failure(ProviderErrorKind::InvalidResponse)));
        }
        script
            .pop_front()
            .unwrap_or_else(|| Err(failure(ProviderErrorKind::InvalidResponse)))
    }
}
