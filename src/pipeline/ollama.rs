//! Blocking Ollama HTTP client shared by the perception and explanation adapters.
//!
//! Adapters run on tokio's blocking pool, so the client is synchronous. The
//! underlying `reqwest::blocking::Client` is created per call: it owns its own
//! runtime and must not be built or dropped on an async worker thread.

use std::time::Duration;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::AdapterError;

/// Default Ollama instance.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("Cannot connect to Ollama at {0}")]
    Connection(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Ollama returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Unreadable Ollama response: {0}")]
    ResponseParsing(String),
}

impl From<OllamaError> for AdapterError {
    fn from(err: OllamaError) -> Self {
        match err {
            OllamaError::Connection(url) => AdapterError::Unavailable(url),
            OllamaError::Timeout(secs) => AdapterError::Timeout(format!("no response in {secs}s")),
            OllamaError::Status { status, body } => AdapterError::Service { status, body },
            OllamaError::Http(msg) => AdapterError::Unavailable(msg),
            OllamaError::ResponseParsing(msg) => AdapterError::InvalidOutput(msg),
        }
    }
}

/// Ollama `/api/chat` client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    timeout_secs: u64,
}

/// One chat turn sent to `/api/chat`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
            images: None,
        }
    }

    /// User turn carrying one image, base64-encoded for the wire.
    pub fn user_with_image(content: impl Into<String>, image: &[u8]) -> Self {
        Self {
            role: "user",
            content: content.into(),
            images: Some(vec![base64::engine::general_purpose::STANDARD.encode(image)]),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    pub fn default_local() -> Self {
        Self::new(DEFAULT_OLLAMA_URL, 60)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send a non-streaming chat request and return the assistant text.
    ///
    /// `json_mode` asks Ollama to constrain output to a JSON document.
    pub fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        json_mode: bool,
    ) -> Result<String, OllamaError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| OllamaError::Http(e.to_string()))?;

        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model,
            messages,
            stream: false,
            format: json_mode.then_some("json"),
            options: ChatOptions { temperature: 0.0 },
        };

        let response = client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                OllamaError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                OllamaError::Timeout(self.timeout_secs)
            } else {
                OllamaError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OllamaError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| OllamaError::ResponseParsing(e.to_string()))?;

        Ok(parsed.message.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::policy::FailureKind;

    #[test]
    fn constructor_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", 60);
        assert_eq!(client.base_url(), "http://localhost:11434");
    }

    #[test]
    fn default_local_uses_standard_port() {
        assert_eq!(OllamaClient::default_local().base_url(), DEFAULT_OLLAMA_URL);
    }

    #[test]
    fn image_message_is_base64() {
        let msg = ChatMessage::user_with_image("describe", b"abc");
        assert_eq!(msg.images.as_deref(), Some(&["YWJj".to_string()][..]));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
    }

    #[test]
    fn text_message_omits_images() {
        let json = serde_json::to_value(ChatMessage::system("rules")).unwrap();
        assert!(json.get("images").is_none());
    }

    #[test]
    fn error_mapping_follows_failure_taxonomy() {
        let cases = [
            (OllamaError::Connection("http://x".into()), FailureKind::TransientFailure),
            (OllamaError::Timeout(30), FailureKind::Timeout),
            (
                OllamaError::Status {
                    status: 503,
                    body: "loading".into(),
                },
                FailureKind::TransientFailure,
            ),
            (
                OllamaError::Status {
                    status: 404,
                    body: "model not found".into(),
                },
                FailureKind::Fatal,
            ),
            (OllamaError::ResponseParsing("eof".into()), FailureKind::InvalidOutput),
        ];
        for (err, expected) in cases {
            let adapter: AdapterError = err.into();
            assert_eq!(adapter.default_kind(), expected, "{adapter}");
        }
    }

    #[test]
    fn unreachable_server_is_connection_error() {
        // Port 9 (discard) is closed on test hosts.
        let client = OllamaClient::new("http://127.0.0.1:9", 2);
        let err = client
            .chat("any", &[ChatMessage::user("hi")], false)
            .unwrap_err();
        assert!(matches!(err, OllamaError::Connection(_) | OllamaError::Http(_)));
    }
}
