use crate::core::upstream::UpstreamError;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::{mpsc, watch};

#[derive(Debug, PartialEq)]
pub enum StreamingStatus {
    Uninitialized,
    Started,
    Interrupted,
    Stopped,
}

pub enum ChatResponse {
    /// `Final` channel text
    Chunk(String),
    ModelError(UpstreamError),
    Done, //finish flag
}

/// Caller-facing side of a turn. Dropping it before `Done` cancels the turn.
pub struct Streamer {
    pub rx: mpsc::Receiver<ChatResponse>,
    pub status: StreamingStatus,
    pub disconnect_tx: Option<watch::Sender<bool>>,
}

impl Streamer {
    pub fn new(rx: mpsc::Receiver<ChatResponse>, disconnect_tx: watch::Sender<bool>) -> Self {
        Self {
            rx,
            status: StreamingStatus::Uninitialized,
            disconnect_tx: Some(disconnect_tx),
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        if self.status != StreamingStatus::Stopped {
            if let Some(tx) = self.disconnect_tx.as_ref() {
                let _ = tx.send(true);
            }
        }
    }
}

impl Stream for Streamer {
    type Item = Result<String, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if matches!(
            self.status,
            StreamingStatus::Stopped | StreamingStatus::Interrupted
        ) {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(resp)) => match resp {
                ChatResponse::Chunk(text) => {
                    if self.status != StreamingStatus::Started {
                        self.status = StreamingStatus::Started;
                    }
                    Poll::Ready(Some(Ok(text)))
                }
                ChatResponse::ModelError(e) => {
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(Some(Err(e)))
                }
                ChatResponse::Done => {
                    self.status = StreamingStatus::Stopped;
                    Poll::Ready(None)
                }
            },
            Poll::Ready(None) => {
                // sender dropped without Done: the turn task died
                self.status = StreamingStatus::Interrupted;
                Poll::Ready(Some(Err(UpstreamError::Stream(
                    "turn ended without completing the stream".to_string(),
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
