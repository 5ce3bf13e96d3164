//! Conversation history

use serde::{Deserialize, Serialize};

use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in OpenAI chat format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_owned()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::text(Role::System, content)
    }

    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::text(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Assistant turn that requests tool calls
    #[must_use]
    pub fn tool_request(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.filter(|c| !c.is_empty()),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    /// Result of one tool call
    #[must_use]
    pub fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.to_owned()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_owned()),
        }
    }
}

/// Append-only message log behind one leading system message
///
/// Only ever cleared in full; the system prompt survives a clear.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    system: ChatMessage,
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    #[must_use]
    pub fn new(system_prompt: &str) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            messages: Vec::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Messages after the system prompt
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop every message except the system prompt
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Messages after the system prompt
    #[must_use]
    pub fn turns(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Full request payload, system prompt first
    #[must_use]
    pub fn to_request(&self) -> Vec<ChatMessage> {
        std::iter::once(self.system.clone())
            .chain(self.messages.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_leads_and_survives_clear() {
        let mut history = ConversationHistory::new("be brief");
        history.push(ChatMessage::user("hi"));
        history.push(ChatMessage::assistant("hello"));
        assert_eq!(history.len(), 2);

        let request = history.to_request();
        assert_eq!(request.len(), 3);
        assert_eq!(request[0].role, Role::System);

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.to_request(), vec![ChatMessage::system("be brief")]);
    }

    #[test]
    fn tool_messages_serialize_in_chat_format() {
        let request = ChatMessage::tool_request(
            Some(String::new()),
            vec![ToolCall::new("call_1", "clock", "{}")],
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["role"], "assistant");
        assert!(json["content"].is_null());
        assert_eq!(json["tool_calls"][0]["function"]["name"], "clock");

        let result = serde_json::to_value(ChatMessage::tool_result("call_1", "noon")).unwrap();
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "call_1");
    }
}
