use crate::tools::{ToolResultMessage, TOOL_ROLE};
use crate::utils::config::ModelSelection;
use serde::{Deserialize, Serialize};

pub mod logger;
pub mod parser;
pub mod streaming;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == TOOL_ROLE
    }
}

impl From<ToolResultMessage> for ChatMessage {
    fn from(msg: ToolResultMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content,
            tool_call_id: Some(msg.tool_call_id),
            name: Some(msg.name),
        }
    }
}

/// One chat or story-generation turn as submitted by a caller.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TurnRequest {
    pub messages: Vec<ChatMessage>,
    pub project_id: Option<String>,
    pub chapter: Option<usize>,
    #[serde(flatten)]
    pub selection: ModelSelection,
}
