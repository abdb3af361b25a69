// src/tools/mod.rs
//! Tool calling support for quill-rs
//!
//! Tool calls are embedded inline in the model's text output. The channel
//! filter separates them from prose, the assembler turns each span into a
//! [`ToolCallRecord`], and the registry dispatches it to a domain handler
//! whose outcome becomes a [`ToolResultMessage`] in the conversation.

pub mod assembler;
pub mod helpers;
pub mod registry;
pub mod schema;
pub mod sourcebook;
pub mod story;

use crate::server::parser::TagConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub use assembler::{AssembledCall, MalformedCall, ToolCallAssembler};
pub use registry::{RegistryError, RequestContext, ToolError, ToolHandler, ToolRegistry};

pub const TOOL_ROLE: &str = "tool";

/// Set when a handler changed the project's story file
pub const STORY_CHANGED: &str = "story_changed";
/// Set when a handler changed the project's sourcebook
pub const SOURCEBOOK_CHANGED: &str = "sourcebook_changed";

/// Function definition advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Function {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: Function,
}

/// Builder for creating Tool definitions
pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Value,
}

impl ToolBuilder {
    fn new(name: String, description: String) -> Self {
        Self {
            name,
            description,
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    /// Set custom parameters schema
    pub fn parameters_schema(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn build(self) -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: Function {
                name: self.name,
                description: self.description,
                parameters: self.parameters,
            },
        }
    }
}

pub fn function_tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name.into(), description.into())
}

/// Generate a compact tool call ID with required `call_` prefix.
/// Uses 16 hex chars (64 bits) from UUIDv4 for low collision risk and shorter payloads.
pub fn generate_tool_call_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("call_{}", &raw[..16])
}

/// A fully delimited and parsed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub call_id: String,
}

/// Outcome of one dispatch, replayed to the model on the next turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultMessage {
    pub role: String,
    pub tool_call_id: String,
    pub name: String,
    /// JSON-encoded object
    pub content: String,
}

impl ToolResultMessage {
    pub fn success(call_id: impl Into<String>, name: impl Into<String>, value: &Value) -> Self {
        let content = match value {
            Value::Object(_) => value.to_string(),
            other => serde_json::json!({ "result": other }).to_string(),
        };
        Self {
            role: TOOL_ROLE.to_string(),
            tool_call_id: call_id.into(),
            name: name.into(),
            content,
        }
    }

    pub fn error(
        call_id: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            role: TOOL_ROLE.to_string(),
            tool_call_id: call_id.into(),
            name: name.into(),
            content: serde_json::json!({ "error": message.into() }).to_string(),
        }
    }

    pub fn content_json(&self) -> Option<Value> {
        serde_json::from_str(&self.content).ok()
    }

    /// The error message, if this result reports a failure
    pub fn error_message(&self) -> Option<String> {
        self.content_json()?
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Side effects recorded by handlers during dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationFlags(BTreeMap<String, bool>);

impl MutationFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str) {
        self.0.insert(name.to_string(), true);
    }

    pub fn get(&self, name: &str) -> bool {
        self.0.get(name).copied().unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        self.0.values().any(|v| *v)
    }

    pub fn merge(&mut self, other: &MutationFlags) {
        for (name, value) in &other.0 {
            if *value {
                self.0.insert(name.clone(), true);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Format tool definitions for injection into the prompt
#[derive(Debug, Clone)]
pub struct ToolFormat {}

impl ToolFormat {
    /// System prompt section describing the tools and the marker format
    pub fn tool_prompt(tags: &TagConfig, tools: &[Tool]) -> String {
        let start_tag = &tags.open;
        let end_tag = &tags.close;
        let definitions = tools
            .iter()
            .map(|tool| serde_json::to_string(&tool.function).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n");
        format!(
            "You may call the following functions:\n<tools>\n{definitions}\n</tools>\n\n\
            For each function call, wrap the function name and arguments in {start_tag}{end_tag} tags:\n\
            {start_tag}\n\
            {{\"name\": \"<function-name>\", \"arguments\": <args-json-object>}}\n\
            {end_tag}\n\n\
            Rules:\n\
            - Do NOT use code blocks around tool calls\n\
            - The \"name\" and \"arguments\" fields are required\n\
            - Only call functions listed between <tools> and </tools>\n\
            - Each result is returned to you as a message with role \"tool\"",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_id_format() {
        let id = generate_tool_call_id();
        assert!(id.starts_with("call_"));
        assert_eq!(id.len(), "call_".len() + 16);
        assert_ne!(id, generate_tool_call_id());
    }

    #[test]
    fn result_message_serializes_with_tool_role() {
        let msg = ToolResultMessage::success("call_1", "read_chapter", &json!({"title": "One"}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "call_1");
        assert_eq!(msg.content_json(), Some(json!({"title": "One"})));
        assert_eq!(msg.error_message(), None);
    }

    #[test]
    fn non_object_results_are_wrapped() {
        let msg = ToolResultMessage::success("call_1", "count", &json!(3));
        assert_eq!(msg.content_json(), Some(json!({"result": 3})));
    }

    #[test]
    fn error_message_is_json_object() {
        let msg = ToolResultMessage::error("call_9", "x", "Unknown tool: x");
        assert_eq!(msg.content_json(), Some(json!({"error": "Unknown tool: x"})));
        assert_eq!(msg.error_message().as_deref(), Some("Unknown tool: x"));
    }

    #[test]
    fn mutation_flags_merge() {
        let mut a = MutationFlags::new();
        assert!(!a.any());
        let mut b = MutationFlags::new();
        b.set(STORY_CHANGED);
        a.merge(&b);
        assert!(a.get(STORY_CHANGED));
        assert!(!a.get(SOURCEBOOK_CHANGED));
        assert!(a.any());
    }

    #[test]
    fn tool_prompt_mentions_markers_and_tools() {
        let tools = vec![function_tool("list_chapters", "List chapters").build()];
        let prompt = ToolFormat::tool_prompt(&TagConfig::default(), &tools);
        assert!(prompt.contains("<tool_call>"));
        assert!(prompt.contains("</tool_call>"));
        assert!(prompt.contains("list_chapters"));
    }
}
