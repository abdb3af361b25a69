// src/tools/sourcebook.rs
//! Sourcebook tools: named reference entries (characters, places, lore)
//! kept next to the story.

use super::helpers::required_str;
use super::registry::{RequestContext, ToolError, ToolHandler};
use super::schema::SchemaBuilder;
use super::{function_tool, MutationFlags, Tool, SOURCEBOOK_CHANGED};
use crate::store::{ProjectStore, SourcebookEntry, StoreError};
use serde_json::{json, Value};
use std::sync::Arc;

pub const LIST_SOURCEBOOK: &str = "list_sourcebook";
pub const GET_SOURCEBOOK_ENTRY: &str = "get_sourcebook_entry";
pub const UPSERT_SOURCEBOOK_ENTRY: &str = "upsert_sourcebook_entry";
pub const DELETE_SOURCEBOOK_ENTRY: &str = "delete_sourcebook_entry";

pub struct SourcebookTools {
    store: Arc<ProjectStore>,
}

impl SourcebookTools {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self { store }
    }

    fn upsert(
        &self,
        project: &str,
        arguments: &Value,
        mutations: &mut MutationFlags,
    ) -> Result<Value, ToolError> {
        let name = required_str(arguments, "name")?.trim();
        if name.is_empty() {
            return Err(ToolError::domain("Sourcebook entry name must not be empty"));
        }
        let description = required_str(arguments, "description")?;

        let created = self.store.update_sourcebook(project, |book| {
            match book
                .entries
                .iter_mut()
                .find(|e| e.name.eq_ignore_ascii_case(name))
            {
                Some(entry) => {
                    entry.description = description.to_string();
                    Ok(false)
                }
                None => {
                    book.entries.push(SourcebookEntry {
                        name: name.to_string(),
                        description: description.to_string(),
                    });
                    Ok(true)
                }
            }
        })?;
        mutations.set(SOURCEBOOK_CHANGED);
        Ok(json!({ "name": name, "created": created }))
    }

    fn delete(
        &self,
        project: &str,
        arguments: &Value,
        mutations: &mut MutationFlags,
    ) -> Result<Value, ToolError> {
        let name = required_str(arguments, "name")?;
        self.store.update_sourcebook(project, |book| {
            let before = book.entries.len();
            book.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
            if book.entries.len() == before {
                return Err(StoreError::NotFound(format!("sourcebook entry '{name}'")));
            }
            Ok(())
        })?;
        mutations.set(SOURCEBOOK_CHANGED);
        Ok(json!({ "name": name, "deleted": true }))
    }
}

impl ToolHandler for SourcebookTools {
    fn tools(&self) -> Vec<Tool> {
        let by_name = || {
            SchemaBuilder::object()
                .string_prop("name", "Entry name (case-insensitive)", true)
                .build()
        };
        vec![
            function_tool(LIST_SOURCEBOOK, "List the names of all sourcebook entries").build(),
            function_tool(GET_SOURCEBOOK_ENTRY, "Read one sourcebook entry")
                .parameters_schema(by_name())
                .build(),
            function_tool(
                UPSERT_SOURCEBOOK_ENTRY,
                "Create a sourcebook entry or replace its description",
            )
            .parameters_schema(
                SchemaBuilder::object()
                    .string_prop("name", "Entry name", true)
                    .string_prop("description", "What the story should know about it", true)
                    .build(),
            )
            .build(),
            function_tool(DELETE_SOURCEBOOK_ENTRY, "Delete a sourcebook entry")
                .parameters_schema(by_name())
                .build(),
        ]
    }

    fn call(
        &self,
        name: &str,
        arguments: &Value,
        _call_id: &str,
        ctx: &RequestContext,
        mutations: &mut MutationFlags,
    ) -> Result<Option<Value>, ToolError> {
        let project = ctx.require_project()?;
        let value = match name {
            LIST_SOURCEBOOK => {
                let book = self.store.load_sourcebook(project)?;
                let names: Vec<&str> = book.entries.iter().map(|e| e.name.as_str()).collect();
                json!({ "entries": names })
            }
            GET_SOURCEBOOK_ENTRY => {
                let wanted = required_str(arguments, "name")?;
                let book = self.store.load_sourcebook(project)?;
                let entry = book.find(wanted).ok_or_else(|| {
                    ToolError::domain(format!("No sourcebook entry named '{wanted}'"))
                })?;
                serde_json::to_value(entry)?
            }
            UPSERT_SOURCEBOOK_ENTRY => self.upsert(project, arguments, mutations)?,
            DELETE_SOURCEBOOK_ENTRY => self.delete(project, arguments, mutations)?,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolCallRecord, ToolRegistry};

    fn setup() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create_project("atlas", "Atlas").unwrap();
        let registry = ToolRegistry::builder()
            .register(SourcebookTools::new(store))
            .build()
            .unwrap();
        (dir, registry)
    }

    fn call(registry: &ToolRegistry, name: &str, arguments: Value) -> (Value, MutationFlags) {
        let mut mutations = MutationFlags::new();
        let record = ToolCallRecord {
            name: name.to_string(),
            arguments,
            call_id: "call_book".to_string(),
        };
        let msg = registry.dispatch(&record, &RequestContext::for_project("atlas"), &mut mutations);
        (msg.content_json().unwrap(), mutations)
    }

    #[test]
    fn upsert_get_list_delete() {
        let (_dir, registry) = setup();
        let (created, mutations) = call(
            &registry,
            UPSERT_SOURCEBOOK_ENTRY,
            json!({"name": "Mira", "description": "A cartographer."}),
        );
        assert_eq!(created, json!({"name": "Mira", "created": true}));
        assert!(mutations.get(SOURCEBOOK_CHANGED));

        let (updated, _) = call(
            &registry,
            UPSERT_SOURCEBOOK_ENTRY,
            json!({"name": "mira", "description": "A retired cartographer."}),
        );
        assert_eq!(updated["created"], false);

        let (entry, mutations) = call(&registry, GET_SOURCEBOOK_ENTRY, json!({"name": "MIRA"}));
        assert_eq!(entry["description"], "A retired cartographer.");
        assert!(!mutations.any());

        let (listing, _) = call(&registry, LIST_SOURCEBOOK, json!({}));
        assert_eq!(listing, json!({"entries": ["Mira"]}));

        let (deleted, mutations) = call(&registry, DELETE_SOURCEBOOK_ENTRY, json!({"name": "Mira"}));
        assert_eq!(deleted["deleted"], true);
        assert!(mutations.get(SOURCEBOOK_CHANGED));
    }

    #[test]
    fn missing_entries_are_domain_errors() {
        let (_dir, registry) = setup();
        let (result, _) = call(&registry, GET_SOURCEBOOK_ENTRY, json!({"name": "Nobody"}));
        assert_eq!(result, json!({"error": "No sourcebook entry named 'Nobody'"}));

        let (result, mutations) = call(&registry, DELETE_SOURCEBOOK_ENTRY, json!({"name": "Nobody"}));
        assert_eq!(result, json!({"error": "sourcebook entry 'Nobody' not found"}));
        assert!(!mutations.any());
    }

    #[test]
    fn blank_name_is_rejected() {
        let (_dir, registry) = setup();
        let (result, mutations) = call(
            &registry,
            UPSERT_SOURCEBOOK_ENTRY,
            json!({"name": "  ", "description": "x"}),
        );
        assert!(result["error"].as_str().unwrap().contains("must not be empty"));
        assert!(!mutations.any());
    }
}
