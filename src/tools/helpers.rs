// src/tools/helpers.rs
//! Helper functions for tool call processing.
//!
//! Argument normalization against a tool's schema and log formatting.

use super::registry::ToolError;
use super::schema::missing_required;
use super::{Tool, ToolCallRecord, ToolResultMessage};
use serde_json::{Map, Value};

/// Check arguments against the tool schema and drop undeclared properties.
///
/// Returns the normalized arguments, or an error detail for the model.
pub fn check_arguments(tool: &Tool, arguments: &Value) -> Result<Value, String> {
    let name = &tool.function.name;
    let Some(args) = arguments.as_object() else {
        return Err(format!("Arguments for tool '{name}' must be a JSON object"));
    };

    let schema = &tool.function.parameters;
    let missing = missing_required(schema, args);
    if !missing.is_empty() {
        return Err(format!(
            "Missing required argument(s) for '{}': {}",
            name,
            missing.join(", ")
        ));
    }

    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(arguments.clone());
    };
    let mut filtered = Map::new();
    for (key, value) in args {
        if props.contains_key(key) {
            filtered.insert(key.clone(), value.clone());
        } else {
            crate::log_warn!("Dropping undeclared argument '{}' for tool '{}'", key, name);
        }
    }
    Ok(Value::Object(filtered))
}

pub fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    optional_str(arguments, key)?
        .ok_or_else(|| ToolError::domain(format!("Argument '{key}' is required")))
}

pub fn optional_str<'a>(arguments: &'a Value, key: &str) -> Result<Option<&'a str>, ToolError> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ToolError::domain(format!("Argument '{key}' must be a string"))),
    }
}

/// Non-negative integer argument; numeric strings are accepted.
pub fn optional_index(arguments: &Value, key: &str) -> Result<Option<usize>, ToolError> {
    let invalid = || ToolError::domain(format!("Argument '{key}' must be a non-negative integer"));
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(invalid),
        Some(Value::String(s)) => s.trim().parse::<usize>().map(Some).map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

pub fn required_index(arguments: &Value, key: &str) -> Result<usize, ToolError> {
    optional_index(arguments, key)?
        .ok_or_else(|| ToolError::domain(format!("Argument '{key}' is required")))
}

/// Format a tool call for logging, truncating long arguments
pub fn format_tool_call_summary(record: &ToolCallRecord) -> String {
    let args = record.arguments.to_string().replace('\n', " ");
    let truncated = if args.chars().count() > 160 {
        let snippet: String = args.chars().take(160).collect();
        format!("{}...", snippet)
    } else {
        args
    };
    format!("{}(args={}) [{}]", record.name, truncated, record.call_id)
}

pub fn log_tool_call(label: &str, record: &ToolCallRecord) {
    crate::log_info!("{} tool call: {}", label, format_tool_call_summary(record));
}

/// Log a batch of results with a short status per call
pub fn log_tool_results(results: &[ToolResultMessage]) {
    if results.is_empty() {
        return;
    }
    let summary = results
        .iter()
        .map(|r| match r.error_message() {
            Some(err) => format!("{} [{}] error: {}", r.name, r.tool_call_id, err),
            None => format!("{} [{}] ok", r.name, r.tool_call_id),
        })
        .collect::<Vec<_>>()
        .join(", ");
    crate::log_info!("{} tool result(s): {}", results.len(), summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::function_tool;
    use crate::tools::schema::SchemaBuilder;
    use serde_json::json;

    fn chapter_tool() -> Tool {
        function_tool("read_chapter", "Read a chapter")
            .parameters_schema(
                SchemaBuilder::object()
                    .integer_prop("index", "Chapter index", true)
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_undeclared_arguments_are_dropped() {
        let args = check_arguments(&chapter_tool(), &json!({"index": 1, "verbose": true})).unwrap();
        assert_eq!(args, json!({"index": 1}));
    }

    #[test]
    fn test_missing_required_argument() {
        let err = check_arguments(&chapter_tool(), &json!({})).unwrap_err();
        assert_eq!(err, "Missing required argument(s) for 'read_chapter': index");
    }

    #[test]
    fn test_argument_accessors() {
        let args = json!({"index": 2, "text": "hi", "raw": "7", "neg": -1, "flag": true});
        assert_eq!(required_index(&args, "index").unwrap(), 2);
        assert_eq!(required_index(&args, "raw").unwrap(), 7);
        assert!(matches!(required_index(&args, "neg"), Err(ToolError::Domain(_))));
        assert_eq!(optional_index(&args, "missing").unwrap(), None);
        assert_eq!(required_str(&args, "text").unwrap(), "hi");
        assert!(matches!(required_str(&args, "flag"), Err(ToolError::Domain(_))));
        assert!(matches!(required_str(&args, "missing"), Err(ToolError::Domain(_))));
    }

    #[test]
    fn test_summary_truncates_long_arguments() {
        let record = ToolCallRecord {
            name: "write_chapter".to_string(),
            arguments: json!({"content": "x".repeat(500)}),
            call_id: "call_1".to_string(),
        };
        let summary = format_tool_call_summary(&record);
        assert!(summary.starts_with("write_chapter(args="));
        assert!(summary.contains("..."));
        assert!(summary.len() < 220);
    }
}
