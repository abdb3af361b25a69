// src/tools/registry.rs
//! Static tool registry and dispatcher.
//!
//! Handlers are registered once at startup; every tool name a handler declares
//! routes to it and duplicates are rejected. Dispatch never fails: unknown
//! names, handler errors and even handler panics become error results.

use super::assembler::AssembledCall;
use super::helpers;
use super::{MutationFlags, Tool, ToolCallRecord, ToolResultMessage};
use crate::store::StoreError;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Name reported for payloads that did not yield a usable tool name
pub const INVALID_TOOL_NAME: &str = "invalid_tool_call";

/// Ambient request information handed to every handler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub request_id: String,
    pub project_id: Option<String>,
    /// Chapter the request is focused on, if any
    pub chapter: Option<usize>,
    pub model: Option<String>,
}

impl RequestContext {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            project_id: Some(project_id.into()),
            ..Self::default()
        }
    }

    pub fn require_project(&self) -> Result<&str, ToolError> {
        self.project_id
            .as_deref()
            .ok_or_else(|| ToolError::Domain("No project is active for this request".to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Expected failure the model can act on; reported verbatim
    #[error("{0}")]
    Domain(String),

    #[error("{0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolError {
    pub fn domain(detail: impl Into<String>) -> Self {
        ToolError::Domain(detail.into())
    }
}

impl From<StoreError> for ToolError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::InvalidProjectId(_) => {
                ToolError::Domain(err.to_string())
            }
            other => ToolError::Unexpected(other.to_string()),
        }
    }
}

/// A domain handler serving one or more tool names.
pub trait ToolHandler: Send + Sync {
    /// Definitions of every tool name this handler serves
    fn tools(&self) -> Vec<Tool>;

    /// Run `name`. Returning `Ok(None)` is a handler bug and is reported as such.
    fn call(
        &self,
        name: &str,
        arguments: &Value,
        call_id: &str,
        ctx: &RequestContext,
        mutations: &mut MutationFlags,
    ) -> Result<Option<Value>, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is registered more than once")]
    Duplicate(String),
    #[error("tool names must not be empty")]
    EmptyName,
}

struct Entry {
    tool: Tool,
    handler: Arc<dyn ToolHandler>,
}

#[derive(Default)]
pub struct ToolRegistryBuilder {
    handlers: Vec<Arc<dyn ToolHandler>>,
}

impl ToolRegistryBuilder {
    pub fn register(mut self, handler: impl ToolHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<ToolRegistry, RegistryError> {
        let mut entries: HashMap<String, Entry> = HashMap::new();
        let mut order = Vec::new();
        for handler in self.handlers {
            for tool in handler.tools() {
                let name = tool.function.name.clone();
                if name.trim().is_empty() {
                    return Err(RegistryError::EmptyName);
                }
                if entries.contains_key(&name) {
                    return Err(RegistryError::Duplicate(name));
                }
                order.push(name.clone());
                entries.insert(
                    name,
                    Entry {
                        tool,
                        handler: Arc::clone(&handler),
                    },
                );
            }
        }
        Ok(ToolRegistry { entries, order })
    }
}

/// Immutable map from tool name to handler.
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Tool definitions in registration order
    pub fn tools(&self) -> Vec<Tool> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|entry| entry.tool.clone())
            .collect()
    }

    /// Execute one tool call and turn the outcome into a result message.
    pub fn dispatch(
        &self,
        record: &ToolCallRecord,
        ctx: &RequestContext,
        mutations: &mut MutationFlags,
    ) -> ToolResultMessage {
        let name = record.name.as_str();
        let call_id = record.call_id.as_str();

        let Some(entry) = self.entries.get(name) else {
            crate::log_warn!(
                "Tool '{}' is not registered. Available tools: {:?}",
                name,
                self.order
            );
            return ToolResultMessage::error(call_id, name, format!("Unknown tool: {name}"));
        };

        let arguments = match helpers::check_arguments(&entry.tool, &record.arguments) {
            Ok(arguments) => arguments,
            Err(detail) => return ToolResultMessage::error(call_id, name, detail),
        };

        helpers::log_tool_call("Dispatching", record);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            entry.handler.call(name, &arguments, call_id, ctx, mutations)
        }));

        match outcome {
            Ok(Ok(Some(value))) => ToolResultMessage::success(call_id, name, &value),
            Ok(Ok(None)) => {
                crate::log_error!("Handler for '{}' returned no result", name);
                ToolResultMessage::error(
                    call_id,
                    name,
                    format!("Handler returned no result for: {name}"),
                )
            }
            Ok(Err(ToolError::Domain(detail))) => ToolResultMessage::error(call_id, name, detail),
            Ok(Err(err)) => {
                crate::log_error!("Tool '{}' failed: {}", name, err);
                ToolResultMessage::error(
                    call_id,
                    name,
                    format!("Tool failed with unexpected error: {err}"),
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                crate::log_error!("Tool '{}' panicked: {}", name, message);
                ToolResultMessage::error(
                    call_id,
                    name,
                    format!("Tool failed with unexpected error: {message}"),
                )
            }
        }
    }

    /// Dispatch an assembler result; malformed payloads become error results.
    pub fn dispatch_assembled(
        &self,
        call: &AssembledCall,
        ctx: &RequestContext,
        mutations: &mut MutationFlags,
    ) -> ToolResultMessage {
        match call {
            AssembledCall::Ready(record) => self.dispatch(record, ctx, mutations),
            AssembledCall::Malformed(bad) => {
                crate::log_warn!("Malformed tool call {}: {}", bad.call_id, bad.error);
                ToolResultMessage::error(
                    &bad.call_id,
                    bad.name.as_deref().unwrap_or(INVALID_TOOL_NAME),
                    &bad.error,
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
