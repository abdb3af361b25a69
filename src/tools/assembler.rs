// src/tools/assembler.rs
//! Collects tool payload fragments per span and parses each closed span.
//!
//! Payload problems never raise: they become [`MalformedCall`]s which the
//! registry reports back to the model as tool errors so it can self-correct.

use super::ToolCallRecord;
use crate::server::parser::{Channel, ContentEvent};
use serde_json::{Map, Value};

/// A span whose payload could not be turned into a tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCall {
    pub call_id: String,
    /// Name recovered from the payload, when there was one
    pub name: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssembledCall {
    Ready(ToolCallRecord),
    Malformed(MalformedCall),
}

impl AssembledCall {
    pub fn call_id(&self) -> &str {
        match self {
            AssembledCall::Ready(record) => &record.call_id,
            AssembledCall::Malformed(bad) => &bad.call_id,
        }
    }
}

#[derive(Debug)]
struct OpenSpan {
    call_id: String,
    payload: String,
}

#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    open: Option<OpenSpan>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Start collecting a new span.
    ///
    /// Spans never overlap when fed from the channel filter; if one is still
    /// open it is returned as unterminated.
    pub fn open(&mut self, call_id: &str) -> Option<AssembledCall> {
        let abandoned = self.finish();
        self.open = Some(OpenSpan {
            call_id: call_id.to_string(),
            payload: String::new(),
        });
        abandoned
    }

    /// Append the text of a `ToolDef` event to the open span.
    pub fn push(&mut self, event: &ContentEvent) {
        if event.channel != Channel::ToolDef {
            return;
        }
        match self.open.as_mut() {
            Some(span) => span.payload.push_str(&event.text),
            None => crate::log_warn!(
                "Dropping tool payload received outside of a span: {:?}",
                event.text
            ),
        }
    }

    /// Close the span with `call_id` and parse its payload.
    pub fn close(&mut self, call_id: &str) -> AssembledCall {
        match self.open.take() {
            Some(span) if span.call_id == call_id => parse_payload(&span.call_id, &span.payload),
            Some(span) => {
                crate::log_warn!(
                    "Closing span {} while {} is open, treating the open span as closed",
                    call_id,
                    span.call_id
                );
                parse_payload(&span.call_id, &span.payload)
            }
            None => AssembledCall::Malformed(MalformedCall {
                call_id: call_id.to_string(),
                name: None,
                error: "Tool call was closed without being opened".to_string(),
            }),
        }
    }

    /// End of stream: an open span is reported as an incomplete call.
    pub fn finish(&mut self) -> Option<AssembledCall> {
        let span = self.open.take()?;
        let name = serde_json::from_str::<Value>(span.payload.trim())
            .ok()
            .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string));
        Some(AssembledCall::Malformed(MalformedCall {
            call_id: span.call_id,
            name,
            error: "Tool call was not closed before the stream ended".to_string(),
        }))
    }
}

/// Parse one complete span payload: `{"name": <string>, "arguments": <object>}`.
pub fn parse_payload(call_id: &str, payload: &str) -> AssembledCall {
    let malformed = |name: Option<String>, error: String| {
        AssembledCall::Malformed(MalformedCall {
            call_id: call_id.to_string(),
            name,
            error,
        })
    };

    let value = match serde_json::from_str::<Value>(payload.trim()) {
        Ok(value) => value,
        Err(e) => return malformed(None, format!("Invalid tool call payload: {e}")),
    };
    let Value::Object(mut object) = value else {
        return malformed(None, "Tool call payload must be a JSON object".to_string());
    };

    let name = match object.remove("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => {
            return malformed(
                None,
                "Tool call payload is missing a string \"name\" field".to_string(),
            )
        }
    };

    let arguments = match object.remove("arguments") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(args)) => Value::Object(args),
        // Some models double-encode the arguments object
        Some(Value::String(inner)) => match serde_json::from_str::<Value>(&inner) {
            Ok(Value::Object(args)) => Value::Object(args),
            _ => {
                return malformed(
                    Some(name.clone()),
                    format!("Arguments for tool '{name}' must be a JSON object"),
                )
            }
        },
        Some(_) => {
            return malformed(
                Some(name.clone()),
                format!("Arguments for tool '{name}' must be a JSON object"),
            )
        }
    };

    AssembledCall::Ready(ToolCallRecord {
        name,
        arguments,
        call_id: call_id.to_string(),
    })
}
