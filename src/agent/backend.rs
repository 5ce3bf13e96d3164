//! Completion backends
//!
//! Every backend speaks the OpenAI chat-completions schema. The gateway
//! additionally accepts a `backend` field naming the provider to route to.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::BackendKind;
use super::context::TokenUsage;
use super::history::ChatMessage;
use crate::tools::{ToolCall, ToolDefinition};
use crate::{Error, Result};

/// Chat-completion request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Gateway only: provider to route this request to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

/// Normalized completion result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Final answer with no tool calls
    #[must_use]
    pub fn text(content: &str) -> Self {
        Self {
            content: Some(content.to_owned()),
            ..Self::default()
        }
    }
}

/// A source of completions
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Base URL, for logs and error messages
    fn endpoint(&self) -> &str;

    /// Whether the backend answers right now
    async fn probe(&self) -> bool;

    /// Request one completion
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be reached, or a
    /// backend error for a failed or malformed response
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Context window of `model` (or the loaded model), if the backend says
    async fn context_window(&self, model: Option<&str>) -> Option<u32>;
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// Backend reached over an OpenAI-compatible HTTP API
pub struct OpenAiCompatBackend {
    kind: BackendKind,
    base_url: String,
    client: reqwest::Client,
    api_key: Option<SecretString>,
    probe_timeout: Duration,
}

impl OpenAiCompatBackend {
    /// Create a backend rooted at `base_url` (e.g. `http://127.0.0.1:1234/v1`)
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(kind: BackendKind, base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            api_key: None,
            probe_timeout: Duration::from_secs(2),
        })
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<SecretString>) -> Self {
        self.api_key = api_key;
        self
    }

    #[must_use]
    pub const fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    fn failure(&self, message: impl Into<String>) -> Error {
        Error::Backend {
            backend: self.kind,
            message: message.into(),
        }
    }

    async fn models(&self) -> Result<Value> {
        let response = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.base_url
    }

    async fn probe(&self) -> bool {
        let result = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::debug!(
                    backend = %self.kind,
                    status = %response.status(),
                    "probe rejected"
                );
                false
            }
            Err(e) => {
                tracing::debug!(backend = %self.kind, error = %e, "probe failed");
                false
            }
        }
    }

    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .authorized(
                self.client
                    .post(format!("{}/chat/completions", self.base_url)),
            )
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(backend = %self.kind, error = %e, "completion request failed");
                Error::BackendUnavailable {
                    backend: self.kind,
                    endpoint: self.base_url.clone(),
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(self.failure(format!("HTTP {status}: {body}")));
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| self.failure(format!("invalid completion body: {e}")))?;

        let message = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.failure("response has no choices"))?
            .message;

        Ok(ChatResponse {
            content: message.content,
            tool_calls: message.tool_calls.unwrap_or_default(),
            usage: body.usage,
        })
    }

    async fn context_window(&self, model: Option<&str>) -> Option<u32> {
        let listing = match self.models().await {
            Ok(listing) => listing,
            Err(e) => {
                tracing::debug!(backend = %self.kind, error = %e, "model metadata unavailable");
                return None;
            }
        };

        let entries = listing.get("data").and_then(Value::as_array)?;
        let entry = model
            .and_then(|id| {
                entries
                    .iter()
                    .find(|e| e.get("id").and_then(Value::as_str) == Some(id))
            })
            .or_else(|| {
                entries
                    .iter()
                    .find(|e| e.get("state").and_then(Value::as_str) == Some("loaded"))
            })
            .or_else(|| entries.first())?;

        window_from_metadata(entry)
    }
}

/// Context window from a model metadata entry
///
/// The window a model is actually loaded with beats its theoretical maximum.
#[must_use]
pub fn window_from_metadata(entry: &Value) -> Option<u32> {
    ["loaded_context_length", "context_length", "max_context_length", "context_window"]
        .iter()
        .find_map(|key| entry.get(*key).and_then(Value::as_u64))
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn loaded_window_wins() {
        let entry = json!({"id": "qwen", "loaded_context_length": 8000, "max_context_length": 32768});
        assert_eq!(window_from_metadata(&entry), Some(8000));
    }

    #[test]
    fn falls_back_to_declared_window() {
        assert_eq!(
            window_from_metadata(&json!({"max_context_length": 32768})),
            Some(32768)
        );
        assert_eq!(window_from_metadata(&json!({"context_length": 4096})), Some(4096));
        assert_eq!(window_from_metadata(&json!({"id": "x"})), None);
        assert_eq!(window_from_metadata(&json!({"context_length": 0})), None);
    }

    #[test]
    fn request_omits_unset_fields() {
        let request = ChatRequest {
            messages: vec![ChatMessage::user("hi")],
            model: None,
            tools: None,
            temperature: 0.5,
            max_tokens: 64,
            backend: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("model").is_none());
        assert!(json.get("tools").is_none());
        assert!(json.get("backend").is_none());
        assert_eq!(json["max_tokens"], 64);
    }

    #[test]
    fn parses_tool_call_response() {
        let body: CompletionBody = serde_json::from_value(json!({
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "time", "arguments": "{}"}}
            ]}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }))
        .unwrap();
        assert_eq!(body.usage.unwrap().prompt_tokens, 12);
        let message = &body.choices[0].message;
        assert!(message.content.is_none());
        assert_eq!(message.tool_calls.as_ref().unwrap()[0].function.name, "time");
    }
}
