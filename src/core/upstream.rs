//! Model backend abstraction.
//!
//! An upstream turns a request into a stream of text deltas, each delta being
//! the next string to append. Nothing else about the provider's wire format
//! leaks past this module.

use crate::server::logger::{AuditLog, AuditStatus};
use crate::server::ChatMessage;
use crate::tools::Tool;
use crate::utils::config::SamplingParams;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("upstream stream error: {0}")]
    Stream(String),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: SamplingParams,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
}

pub trait Upstream: Send + Sync {
    fn open(&self, request: &UpstreamRequest) -> Result<DeltaStream, UpstreamError>;
}

impl<U: Upstream + ?Sized> Upstream for Arc<U> {
    fn open(&self, request: &UpstreamRequest) -> Result<DeltaStream, UpstreamError> {
        (**self).open(request)
    }
}

/// Split `text` into pieces of at most `size` chars.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Replays a recorded model output as a delta stream.
#[derive(Debug, Clone)]
pub struct ScriptedUpstream {
    script: String,
    chunk_size: usize,
    delay: Option<Duration>,
    fail_after: Option<usize>,
}

impl ScriptedUpstream {
    pub fn new(script: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            script: script.into(),
            chunk_size: chunk_size.max(1),
            delay: None,
            fail_after: None,
        }
    }

    /// Pause before each delta
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Yield `deltas` deltas, then a stream error
    pub fn failing_after(mut self, deltas: usize) -> Self {
        self.fail_after = Some(deltas);
        self
    }
}

impl Upstream for ScriptedUpstream {
    fn open(&self, _request: &UpstreamRequest) -> Result<DeltaStream, UpstreamError> {
        let mut items: Vec<Result<String, UpstreamError>> = chunk_text(&self.script, self.chunk_size)
            .into_iter()
            .map(Ok)
            .collect();
        if let Some(n) = self.fail_after {
            items.truncate(n);
            items.push(Err(UpstreamError::Stream(format!(
                "connection reset after {n} deltas"
            ))));
        }

        match self.delay {
            Some(delay) => Ok(stream::iter(items)
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed()),
            None => Ok(stream::iter(items).boxed()),
        }
    }
}

/// Records every upstream call in the audit log.
pub struct AuditedUpstream<U> {
    inner: U,
    log: Arc<AuditLog>,
}

impl<U: Upstream> AuditedUpstream<U> {
    pub fn new(inner: U, log: Arc<AuditLog>) -> Self {
        Self { inner, log }
    }
}

impl<U: Upstream> Upstream for AuditedUpstream<U> {
    fn open(&self, request: &UpstreamRequest) -> Result<DeltaStream, UpstreamError> {
        let id = self.log.begin(request);
        match self.inner.open(request) {
            Ok(inner) => Ok(Box::pin(AuditedStream {
                inner,
                log: Arc::clone(&self.log),
                id,
                response: String::new(),
                finished: false,
            })),
            Err(e) => {
                self.log.complete(id, e.to_string(), AuditStatus::Failed);
                Err(e)
            }
        }
    }
}

struct AuditedStream {
    inner: DeltaStream,
    log: Arc<AuditLog>,
    id: u64,
    response: String,
    finished: bool,
}

impl AuditedStream {
    fn finish(&mut self, status: AuditStatus) {
        self.finished = true;
        self.log
            .complete(self.id, std::mem::take(&mut self.response), status);
    }
}

impl Stream for AuditedStream {
    type Item = Result<String, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(delta))) => {
                self.response.push_str(&delta);
                Poll::Ready(Some(Ok(delta)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish(AuditStatus::Failed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish(AuditStatus::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AuditedStream {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(AuditStatus::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> UpstreamRequest {
        UpstreamRequest {
            model: "default".to_string(),
            messages: vec![ChatMessage::user("hi")],
            params: SamplingParams::default(),
            tools: Vec::new(),
        }
    }

    #[test]
    fn chunking_respects_char_boundaries() {
        assert_eq!(chunk_text("héllo", 2), vec!["hé", "ll", "o"]);
        assert!(chunk_text("", 3).is_empty());
        assert_eq!(chunk_text("ab", 0), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn scripted_upstream_replays_text() {
        let upstream = ScriptedUpstream::new("Hello there", 4);
        let deltas: Vec<String> = upstream
            .open(&request())
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hell", "o th", "ere"]);
    }

    #[tokio::test]
    async fn audited_upstream_records_completion() {
        let log = Arc::new(AuditLog::new(10));
        let upstream = AuditedUpstream::new(ScriptedUpstream::new("abc", 1), Arc::clone(&log));
        let joined: String = upstream
            .open(&request())
            .unwrap()
            .map(|d| d.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(joined, "abc");

        let entry = &log.entries()[0];
        assert_eq!(entry.status, AuditStatus::Completed);
        assert_eq!(entry.response, "abc");
        assert_eq!(entry.request["model"], "default");
    }

    #[tokio::test]
    async fn audited_upstream_records_failure_and_cancel() {
        let log = Arc::new(AuditLog::new(10));
        let failing = AuditedUpstream::new(
            ScriptedUpstream::new("abcdef", 1).failing_after(2),
            Arc::clone(&log),
        );
        let items: Vec<_> = failing.open(&request()).unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
        assert_eq!(log.entries()[0].status, AuditStatus::Failed);
        assert_eq!(log.entries()[0].response, "ab");

        let cancelled = AuditedUpstream::new(ScriptedUpstream::new("abcdef", 1), Arc::clone(&log));
        let mut stream = cancelled.open(&request()).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        drop(stream);
        assert_eq!(log.entries()[1].status, AuditStatus::Cancelled);
        assert_eq!(log.entries()[1].response, "a");
    }
}
