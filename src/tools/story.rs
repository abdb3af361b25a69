// src/tools/story.rs
//! Chapter tools over the active project's story file.

use super::helpers::{optional_index, optional_str, required_index, required_str};
use super::registry::{RequestContext, ToolError, ToolHandler};
use super::schema::SchemaBuilder;
use super::{function_tool, MutationFlags, Tool, STORY_CHANGED};
use crate::store::{Chapter, ProjectStore};
use serde_json::{json, Value};
use std::sync::Arc;

pub const LIST_CHAPTERS: &str = "list_chapters";
pub const READ_CHAPTER: &str = "read_chapter";
pub const WRITE_CHAPTER: &str = "write_chapter";
pub const APPEND_TO_CHAPTER: &str = "append_to_chapter";

pub struct StoryTools {
    store: Arc<ProjectStore>,
}

impl StoryTools {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self { store }
    }

    fn list_chapters(&self, project: &str) -> Result<Value, ToolError> {
        let story = self.store.load_story(project)?;
        let chapters: Vec<Value> = story
            .chapters
            .iter()
            .enumerate()
            .map(|(index, chapter)| {
                json!({
                    "index": index,
                    "title": chapter.title,
                    "length": chapter.content.chars().count(),
                })
            })
            .collect();
        Ok(json!({ "title": story.title, "chapters": chapters }))
    }

    fn read_chapter(&self, project: &str, arguments: &Value) -> Result<Value, ToolError> {
        let index = required_index(arguments, "index")?;
        let story = self.store.load_story(project)?;
        let chapter = story
            .chapters
            .get(index)
            .ok_or_else(|| ToolError::domain(format!("Chapter {index} does not exist")))?;
        Ok(json!({
            "index": index,
            "title": chapter.title,
            "content": chapter.content,
        }))
    }

    /// Replace an existing chapter, or add one when `index` is absent or one past the end.
    fn write_chapter(
        &self,
        project: &str,
        arguments: &Value,
        mutations: &mut MutationFlags,
    ) -> Result<Value, ToolError> {
        let index = optional_index(arguments, "index")?;
        let title = optional_str(arguments, "title")?.map(str::to_string);
        let content = required_str(arguments, "content")?.to_string();

        let outcome = self.store.update_story(project, |story| {
            let len = story.chapters.len();
            match index {
                Some(i) if i < len => {
                    let chapter = story.chapter_mut(i)?;
                    chapter.content = content;
                    if let Some(title) = title {
                        chapter.title = title;
                    }
                    Ok(Some((i, false)))
                }
                Some(i) if i > len => Ok(None),
                _ => {
                    story.chapters.push(Chapter {
                        title: title.unwrap_or_else(|| format!("Chapter {}", len + 1)),
                        content,
                    });
                    Ok(Some((len, true)))
                }
            }
        })?;

        let Some((index, created)) = outcome else {
            return Err(ToolError::domain(format!(
                "Chapter {} does not exist; new chapters are added at the end",
                index.unwrap_or_default()
            )));
        };
        mutations.set(STORY_CHANGED);
        Ok(json!({ "index": index, "created": created }))
    }

    fn append_to_chapter(
        &self,
        project: &str,
        arguments: &Value,
        mutations: &mut MutationFlags,
    ) -> Result<Value, ToolError> {
        let index = required_index(arguments, "index")?;
        let text = required_str(arguments, "text")?;
        let length = self.store.update_story(project, |story| {
            let chapter = story.chapter_mut(index)?;
            chapter.content.push_str(text);
            Ok(chapter.content.chars().count())
        })?;
        mutations.set(STORY_CHANGED);
        Ok(json!({ "index": index, "length": length }))
    }
}

impl ToolHandler for StoryTools {
    fn tools(&self) -> Vec<Tool> {
        vec![
            function_tool(LIST_CHAPTERS, "List the chapters of the current story").build(),
            function_tool(READ_CHAPTER, "Read the full text of one chapter")
                .parameters_schema(
                    SchemaBuilder::object()
                        .integer_prop("index", "Zero-based chapter index", true)
                        .build(),
                )
                .build(),
            function_tool(
                WRITE_CHAPTER,
                "Replace a chapter's text, or add a new chapter at the end",
            )
            .parameters_schema(
                SchemaBuilder::object()
                    .integer_prop(
                        "index",
                        "Zero-based chapter index; omit to add a new chapter",
                        false,
                    )
                    .string_prop("title", "Chapter title", false)
                    .string_prop("content", "Full chapter text", true)
                    .build(),
            )
            .build(),
            function_tool(APPEND_TO_CHAPTER, "Append text to the end of a chapter")
                .parameters_schema(
                    SchemaBuilder::object()
                        .integer_prop("index", "Zero-based chapter index", true)
                        .string_prop("text", "Text to append", true)
                        .build(),
                )
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
            LIST_CHAPTERS => self.list_chapters(project)?,
            READ_CHAPTER => self.read_chapter(project, arguments)?,
            WRITE_CHAPTER => self.write_chapter(project, arguments, mutations)?,
            APPEND_TO_CHAPTER => self.append_to_chapter(project, arguments, mutations)?,
            _ => return Ok(None),
        };
        Ok(Some(value))
    }
}
