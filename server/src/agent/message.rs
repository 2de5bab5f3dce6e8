//! Provider-agnostic message types for LLM communication.
//!
//! The runtime builds conversations from these and each provider adapts
//! them to its own SDK, so agent logic never depends on a vendor.

use crate::tools::ToolDescriptor;
use serde::{Deserialize, Serialize};

/// Role of a conversation participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// A tool result fed back to the model.
    Tool,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Provider-assigned call id; echoed on the matching result.
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments exactly as produced by the model.
    pub arguments: String,
}

/// One message in the working conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A streaming completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<AgentMessage>,
    pub tools: Vec<ToolDescriptor>,
}

/// Creates a system message.
#[must_use]
pub fn system(content: &str) -> AgentMessage {
    AgentMessage {
        role: Role::System,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

/// Creates a user message.
#[must_use]
pub fn user(content: &str) -> AgentMessage {
    AgentMessage {
        role: Role::User,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: None,
    }
}

/// Creates an assistant message carrying text, tool calls, or both.
#[must_use]
pub fn assistant(content: &str, tool_calls: Vec<ToolCallRequest>) -> AgentMessage {
    AgentMessage {
        role: Role::Assistant,
        content: content.to_string(),
        tool_calls,
        tool_call_id: None,
    }
}

/// Creates a tool-result message answering `tool_call_id`.
#[must_use]
pub fn tool_result(tool_call_id: &str, content: &str) -> AgentMessage {
    AgentMessage {
        role: Role::Tool,
        content: content.to_string(),
        tool_calls: Vec::new(),
        tool_call_id: Some(tool_call_id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(system("s").role, Role::System);
        assert_eq!(user("u").role, Role::User);
        assert_eq!(assistant("a", Vec::new()).role, Role::Assistant);
        let tr = tool_result("call_1", "out");
        assert_eq!(tr.role, Role::Tool);
        assert_eq!(tr.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn empty_fields_skipped_in_serialization() {
        let json = serde_json::to_string(&user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }
}
