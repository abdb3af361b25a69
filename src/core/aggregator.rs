//! Pass-through stream that persists what it forwarded.
//!
//! The joined text is handed to the persistence callback once, and only when
//! the source ran to completion. The stream ends after the returned future
//! resolves. A source error or the consumer dropping the stream early (client
//! disconnect) leaves the store untouched.

use crate::store::StoreError;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

pub type PersistFuture = BoxFuture<'static, Result<(), StoreError>>;
pub type PersistFn = Box<dyn FnOnce(String) -> PersistFuture + Send>;

pub struct PersistingStream<S, P = PersistFn> {
    source: S,
    buffer: Vec<String>,
    persist: Option<P>,
    saving: Option<PersistFuture>,
    done: bool,
}

impl<S, E, P> PersistingStream<S, P>
where
    S: Stream<Item = Result<String, E>> + Unpin,
    P: FnOnce(String) -> PersistFuture,
{
    pub fn new(factory: impl FnOnce() -> S, persist: P) -> Self {
        Self {
            source: factory(),
            buffer: Vec::new(),
            persist: Some(persist),
            saving: None,
            done: false,
        }
    }

    /// Text forwarded so far
    pub fn buffered_text(&self) -> String {
        self.buffer.concat()
    }

    fn buffered_len(&self) -> usize {
        self.buffer.iter().map(String::len).sum()
    }
}

impl<S, E, P> Stream for PersistingStream<S, P>
where
    S: Stream<Item = Result<String, E>> + Unpin,
    E: Display,
    P: FnOnce(String) -> PersistFuture + Unpin,
{
    type Item = Result<String, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(saving) = this.saving.as_mut() {
                let result = match saving.poll_unpin(cx) {
                    Poll::Ready(result) => result,
                    Poll::Pending => return Poll::Pending,
                };
                this.saving = None;
                match result {
                    Ok(()) => crate::log_info!(
                        "Persisted {} bytes of generated text",
                        this.buffered_len()
                    ),
                    Err(e) => crate::log_error!("Failed to persist generated text: {}", e),
                }
                return Poll::Ready(None);
            }
            if this.done {
                return Poll::Ready(None);
            }
            match Pin::new(&mut this.source).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    this.buffer.push(chunk.clone());
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Poll::Ready(Some(Err(e))) => {
                    crate::log_warn!(
                        "Generation failed, discarding {} chunk(s): {}",
                        this.buffer.len(),
                        e
                    );
                    this.done = true;
                    this.persist = None;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    match this.persist.take() {
                        Some(persist) => this.saving = Some(persist(this.buffer.concat())),
                        None => return Poll::Ready(None),
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S, P> Drop for PersistingStream<S, P> {
    fn drop(&mut self) {
        if !self.done && self.persist.is_some() {
            crate::log_info!(
                "Stream cancelled after {} chunk(s), nothing persisted",
                self.buffer.len()
            );
        } else if self.saving.is_some() {
            crate::log_warn!("Stream dropped while its text was being persisted");
        }
    }
}
