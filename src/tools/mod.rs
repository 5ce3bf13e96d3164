//! Tool calling
//!
//! Tools run in a separate service; the router only knows the
//! `{name, arguments}` → `{result}` | `{error}` contract.

pub mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

pub use executor::HttpToolExecutor;

/// Tool advertised to the backend (OpenAI function schema)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ToolDefinition {
    /// Function tool with a JSON schema for its parameters
    #[must_use]
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_owned(),
            function: FunctionDefinition {
                name: name.to_owned(),
                description: Some(description.to_owned()),
                parameters: Some(parameters),
            },
        }
    }
}

/// Tool invocation requested by a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the backend
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_owned()
}

impl ToolCall {
    #[must_use]
    pub fn new(id: &str, name: &str, arguments: &str) -> Self {
        Self {
            id: id.to_owned(),
            tool_type: function_type(),
            function: FunctionCall {
                name: name.to_owned(),
                arguments: arguments.to_owned(),
            },
        }
    }

    /// Decoded arguments; anything but a JSON object becomes `{}`
    #[must_use]
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str::<Value>(&self.function.arguments) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Performs tool side effects
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tools the service offers
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot be queried
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Run `name` with `arguments`, returning the result text
    ///
    /// # Errors
    ///
    /// Returns error if the call fails or the tool reports an error
    async fn call(&self, name: &str, arguments: &Value) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_parse_as_object() {
        let call = ToolCall::new("call_1", "weather", r#"{"city":"Oslo"}"#);
        assert_eq!(call.parsed_arguments()["city"], "Oslo");
    }

    #[test]
    fn bad_arguments_become_empty_object() {
        for raw in ["", "not json", "[1,2]", "\"text\""] {
            let call = ToolCall::new("call_1", "weather", raw);
            assert_eq!(call.parsed_arguments(), serde_json::json!({}), "input {raw:?}");
        }
    }

    #[test]
    fn tool_call_wire_format() {
        let call: ToolCall = serde_json::from_value(serde_json::json!({
            "id": "call_9",
            "type": "function",
            "function": {"name": "lights", "arguments": "{\"on\":true}"}
        }))
        .unwrap();
        assert_eq!(call.function.name, "lights");
        assert_eq!(call.parsed_arguments()["on"], true);
    }
}
