// src/server/parser.rs
//! Streaming channel filter for separating prose from inline tool calls.
//!
//! Model output arrives as arbitrarily split text deltas. Tool calls are wrapped
//! in model-specific open/close markers embedded in the text itself, so a
//! marker may straddle any number of deltas. The filter holds back the shortest
//! possible run of text (a suffix that could still grow into the active marker)
//! and releases everything else immediately, tagged with its channel.

use crate::tools::generate_tool_call_id;
use crate::utils::config::{ConfigError, ModelType};
use serde::{Deserialize, Serialize};

/// Logical channel a run of streamed text belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Free-form output shown to the user
    Final,
    /// Payload of an embedded tool call
    ToolDef,
}

/// A classified, non-empty run of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEvent {
    pub channel: Channel,
    pub text: String,
}

impl ContentEvent {
    pub fn new(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }
}

/// Open/close marker pair delimiting a tool call span.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConfig {
    pub open: String,
    pub close: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            open: "<tool_call>".to_string(),
            close: "</tool_call>".to_string(),
        }
    }
}

impl TagConfig {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Result<Self, ConfigError> {
        let tags = Self {
            open: open.into(),
            close: close.into(),
        };
        tags.validate()?;
        Ok(tags)
    }

    /// Marker pair used by a model family when it emits tool calls as plain text
    pub fn for_model_type(model_type: &ModelType) -> Self {
        match model_type {
            ModelType::LLaMa => Self {
                open: "<|python_tag|>".to_string(),
                close: "<|eom_id|>".to_string(),
            },
            ModelType::Gemma | ModelType::Gemma3 => Self {
                open: "<start_function_call>".to_string(),
                close: "<end_function_call>".to_string(),
            },
            // Qwen, Phi, GLM, Yi, StableLM, DeepSeek all use the Qwen format
            _ => Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.open.is_empty() || self.close.is_empty() {
            return Err(ConfigError::InvalidTags(
                "tool call markers must not be empty".to_string(),
            ));
        }
        if self.open == self.close {
            return Err(ConfigError::InvalidTags(format!(
                "open and close markers must differ (both are {:?})",
                self.open
            )));
        }
        Ok(())
    }

    pub fn max_len(&self) -> usize {
        self.open.len().max(self.close.len())
    }
}

/// Receiver for everything the filter recognizes, in stream order.
///
/// Span notifications let a consumer tell apart several tool calls that
/// open and close within a single fragment.
pub trait FilterSink {
    fn content(&mut self, event: ContentEvent);

    fn span_opened(&mut self, _call_id: &str) {}

    fn span_closed(&mut self, _call_id: &str) {}
}

impl FilterSink for Vec<ContentEvent> {
    fn content(&mut self, event: ContentEvent) {
        self.push(event);
    }
}

/// Incremental prefix-confirmation automaton over the open/close markers.
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    tags: TagConfig,
    channel: Channel,
    pending: String,
    call_id: Option<String>,
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self::new(TagConfig::default())
    }
}

impl ChannelFilter {
    pub fn new(tags: TagConfig) -> Self {
        Self {
            tags,
            channel: Channel::Final,
            pending: String::new(),
            call_id: None,
        }
    }

    pub fn tags(&self) -> &TagConfig {
        &self.tags
    }

    /// Channel in effect after the most recent `feed`
    pub fn current_channel(&self) -> Channel {
        self.channel
    }

    /// Call id of the span currently open, if any
    pub fn current_call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    /// Text withheld because it may be the start of a marker
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Classify one fragment and return the content it releases.
    pub fn feed(&mut self, fragment: &str) -> Vec<ContentEvent> {
        let mut events = Vec::new();
        self.feed_into(fragment, &mut events);
        events
    }

    /// Classify one fragment, reporting content and span boundaries to `sink`.
    pub fn feed_into<S: FilterSink + ?Sized>(&mut self, fragment: &str, sink: &mut S) {
        let mut combined = std::mem::take(&mut self.pending);
        combined.push_str(fragment);
        let mut rest = combined.as_str();

        loop {
            let found = {
                let tag = self.active_tag();
                rest.find(tag).map(|idx| (idx, tag.len()))
            };
            match found {
                Some((idx, tag_len)) => {
                    if idx > 0 {
                        sink.content(ContentEvent::new(self.channel, &rest[..idx]));
                    }
                    rest = &rest[idx + tag_len..];
                    self.toggle(sink);
                }
                None => {
                    let held = self.partial_tag_suffix(rest);
                    let (ready, hold) = rest.split_at(rest.len() - held);
                    if !ready.is_empty() {
                        sink.content(ContentEvent::new(self.channel, ready));
                    }
                    self.pending = hold.to_string();
                    return;
                }
            }
        }
    }

    /// Release withheld text at end of stream.
    ///
    /// Returns the call id of a span that was opened but never closed.
    pub fn finish_into<S: FilterSink + ?Sized>(&mut self, sink: &mut S) -> Option<String> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            sink.content(ContentEvent::new(self.channel, pending));
        }
        match self.channel {
            Channel::Final => None,
            Channel::ToolDef => self.call_id.clone(),
        }
    }

    pub fn finish(&mut self) -> Vec<ContentEvent> {
        let mut events = Vec::new();
        self.finish_into(&mut events);
        events
    }

    fn active_tag(&self) -> &str {
        match self.channel {
            Channel::Final => &self.tags.open,
            Channel::ToolDef => &self.tags.close,
        }
    }

    fn toggle<S: FilterSink + ?Sized>(&mut self, sink: &mut S) {
        match self.channel {
            Channel::Final => {
                let call_id = generate_tool_call_id();
                self.channel = Channel::ToolDef;
                sink.span_opened(&call_id);
                self.call_id = Some(call_id);
            }
            Channel::ToolDef => {
                self.channel = Channel::Final;
                if let Some(call_id) = self.call_id.take() {
                    sink.span_closed(&call_id);
                }
            }
        }
    }

    /// Byte length of the longest suffix of `text` that is a strict, non-empty
    /// prefix of the active tag.
    fn partial_tag_suffix(&self, text: &str) -> usize {
        let tag = self.active_tag();
        let longest = text.len().min(tag.len().saturating_sub(1));
        (1..=longest)
            .rev()
            .find(|&n| {
                let start = text.len() - n;
                text.is_char_boundary(start) && tag.starts_with(&text[start..])
            })
            .unwrap_or(0)
    }
}
