// src/tools/schema.rs
//! JSON Schema utilities for tool parameters
//!
//! Handlers describe their parameters with [`SchemaBuilder`]; the same schema
//! is advertised to the model and used to check incoming arguments.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Builder for creating JSON Schema objects
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    properties: BTreeMap<String, Value>,
    required: Vec<String>,
}

impl SchemaBuilder {
    /// Create a new object schema builder
    pub fn object() -> Self {
        Self::default()
    }

    pub fn string_prop(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.typed_prop(name, "string", description, required)
    }

    pub fn integer_prop(
        self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.typed_prop(name, "integer", description, required)
    }

    fn typed_prop(
        mut self,
        name: impl Into<String>,
        schema_type: &str,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        let name = name.into();
        self.properties.insert(
            name.clone(),
            json!({
                "type": schema_type,
                "description": description.into()
            }),
        );
        if required {
            self.required.push(name);
        }
        self
    }

    /// Build the final JSON Schema
    pub fn build(self) -> Value {
        json!({
            "type": "object",
            "properties": self.properties,
            "required": self.required
        })
    }
}

/// Names listed under `required` that are absent from `arguments`.
pub fn missing_required(schema: &Value, arguments: &Map<String, Value>) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| !arguments.contains_key(*name))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
