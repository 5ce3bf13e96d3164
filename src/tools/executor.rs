//! HTTP tool executor

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ToolDefinition, ToolExecutor};
use crate::{Error, Result};

/// Per-call timeout; tools run side effects and should answer promptly
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls tools on a service exposing `GET /tools` and `POST /tools/call`
pub struct HttpToolExecutor {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    name: &'a str,
    arguments: &'a Value,
}

#[derive(Deserialize)]
struct CallResponse {
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    tools: Vec<ToolDefinition>,
}

impl HttpToolExecutor {
    /// Create an executor for the service at `base_url`
    #[must_use]
    pub fn new(base_url: &str, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let response = self
            .request(self.client.get(format!("{}/tools", self.base_url)))
            .send()
            .await
            .map_err(|e| Error::Tool(format!("tool service unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Tool(e.to_string()))?;

        let list: ListResponse = response.json().await?;
        tracing::debug!(count = list.tools.len(), "fetched tool definitions");
        Ok(list.tools)
    }

    async fn call(&self, name: &str, arguments: &Value) -> Result<String> {
        tracing::debug!(tool = name, "calling tool");

        let response = self
            .request(self.client.post(format!("{}/tools/call", self.base_url)))
            .timeout(CALL_TIMEOUT)
            .json(&CallRequest { name, arguments })
            .send()
            .await
            .map_err(|e| Error::Tool(format!("tool service unreachable: {e}")))?;

        let status = response.status();
        let body: CallResponse = response
            .json()
            .await
            .map_err(|e| Error::Tool(format!("invalid tool response ({status}): {e}")))?;

        if let Some(error) = body.error {
            return Err(Error::Tool(error));
        }
        if !status.is_success() {
            return Err(Error::Tool(format!("tool service returned {status}")));
        }

        Ok(match body.result {
            Some(Value::String(text)) => text,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        })
    }
}
