//! Per-request turn pipeline.
//!
//! A turn task pulls deltas from the upstream, classifies them with the
//! channel filter, forwards `Final` text to the caller's [`Streamer`] and
//! dispatches each tool span once the delta that closed it has been
//! processed. Handlers do blocking store I/O, so dispatch runs on the
//! blocking pool. Tool results and mutation flags are returned through the
//! task's join handle once the stream ends.

use super::upstream::DeltaStream;
use crate::server::parser::{Channel, ChannelFilter, ContentEvent, FilterSink, TagConfig};
use crate::server::streaming::{ChatResponse, Streamer};
use crate::tools::helpers::log_tool_results;
use crate::tools::{
    AssembledCall, MutationFlags, RequestContext, ToolCallAssembler, ToolRegistry,
    ToolResultMessage,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Results in span order, to be appended to the conversation
    pub tool_results: Vec<ToolResultMessage>,
    pub mutations: MutationFlags,
    /// Everything the upstream sent, markers included
    pub raw_output: String,
    /// `Final` channel text forwarded to the caller
    pub final_text: String,
    /// The caller went away before the stream ended
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Routes filter output: prose to the caller, spans through the assembler
/// into a queue of calls awaiting dispatch.
struct CallCollector {
    assembler: ToolCallAssembler,
    finals: Vec<String>,
    pending: Vec<AssembledCall>,
}

impl FilterSink for CallCollector {
    fn content(&mut self, event: ContentEvent) {
        match event.channel {
            Channel::Final => self.finals.push(event.text),
            Channel::ToolDef => self.assembler.push(&event),
        }
    }

    fn span_opened(&mut self, call_id: &str) {
        if let Some(abandoned) = self.assembler.open(call_id) {
            self.pending.push(abandoned);
        }
    }

    fn span_closed(&mut self, call_id: &str) {
        let call = self.assembler.close(call_id);
        self.pending.push(call);
    }
}

/// Run assembled calls through the registry in span order. Blocking.
pub fn dispatch_calls(
    registry: &ToolRegistry,
    ctx: &RequestContext,
    calls: Vec<AssembledCall>,
) -> (Vec<ToolResultMessage>, MutationFlags) {
    let mut mutations = MutationFlags::new();
    let results = calls
        .iter()
        .map(|call| registry.dispatch_assembled(call, ctx, &mut mutations))
        .collect();
    (results, mutations)
}

/// Synchronous core of a turn: feed deltas, collect prose and tool calls.
pub struct TurnDriver {
    filter: ChannelFilter,
    calls: CallCollector,
    registry: Arc<ToolRegistry>,
    ctx: RequestContext,
    results: Vec<ToolResultMessage>,
    mutations: MutationFlags,
    raw_output: String,
    final_text: String,
}

impl TurnDriver {
    pub fn new(tags: TagConfig, registry: Arc<ToolRegistry>, ctx: RequestContext) -> Self {
        Self {
            filter: ChannelFilter::new(tags),
            calls: CallCollector {
                assembler: ToolCallAssembler::new(),
                finals: Vec::new(),
                pending: Vec::new(),
            },
            registry,
            ctx,
            results: Vec::new(),
            mutations: MutationFlags::new(),
            raw_output: String::new(),
            final_text: String::new(),
        }
    }

    /// Process one delta; returns the `Final` text it released.
    pub fn feed(&mut self, delta: &str) -> Vec<String> {
        self.raw_output.push_str(delta);
        self.filter.feed_into(delta, &mut self.calls);
        self.take_finals()
    }

    /// End of stream: flush withheld text and queue an unterminated span.
    pub fn finish(&mut self) -> Vec<String> {
        if let Some(call_id) = self.filter.finish_into(&mut self.calls) {
            crate::log_warn!("Stream ended inside tool call {}", call_id);
        }
        if let Some(call) = self.calls.assembler.finish() {
            self.calls.pending.push(call);
        }
        self.take_finals()
    }

    /// Calls whose spans closed since the last take, in span order
    pub fn take_pending_calls(&mut self) -> Vec<AssembledCall> {
        std::mem::take(&mut self.calls.pending)
    }

    pub fn record(&mut self, results: Vec<ToolResultMessage>, mutations: MutationFlags) {
        self.results.extend(results);
        self.mutations.merge(&mutations);
    }

    /// Dispatch queued calls on the current thread.
    pub fn dispatch_pending(&mut self) {
        let calls = self.take_pending_calls();
        let (results, mutations) = dispatch_calls(&self.registry, &self.ctx, calls);
        self.record(results, mutations);
    }

    /// Dispatch queued calls on the blocking pool.
    pub async fn dispatch_pending_blocking(&mut self) {
        let calls = self.take_pending_calls();
        if calls.is_empty() {
            return;
        }
        let count = calls.len();
        let registry = Arc::clone(&self.registry);
        let ctx = self.ctx.clone();
        match tokio::task::spawn_blocking(move || dispatch_calls(&registry, &ctx, calls)).await {
            Ok((results, mutations)) => self.record(results, mutations),
            Err(e) => crate::log_error!(
                "[{}] Dispatch of {} tool call(s) did not finish: {}",
                self.ctx.request_id,
                count,
                e
            ),
        }
    }

    pub fn tool_results(&self) -> &[ToolResultMessage] {
        &self.results
    }

    pub fn into_outcome(self) -> TurnOutcome {
        TurnOutcome {
            tool_results: self.results,
            mutations: self.mutations,
            raw_output: self.raw_output,
            final_text: self.final_text,
            cancelled: false,
            error: None,
        }
    }

    fn take_finals(&mut self) -> Vec<String> {
        let finals = std::mem::take(&mut self.calls.finals);
        for text in &finals {
            self.final_text.push_str(text);
        }
        finals
    }
}

async fn forward(tx: &mpsc::Sender<ChatResponse>, chunks: Vec<String>) -> bool {
    for chunk in chunks {
        if tx.send(ChatResponse::Chunk(chunk)).await.is_err() {
            return false;
        }
    }
    true
}

/// Spawn the task driving one turn.
///
/// Dropping the returned [`Streamer`] before it is exhausted cancels the turn
/// and drops the upstream stream. Spans already dispatched keep their effects.
pub fn spawn_turn(
    mut upstream: DeltaStream,
    tags: TagConfig,
    registry: Arc<ToolRegistry>,
    ctx: RequestContext,
) -> (Streamer, JoinHandle<TurnOutcome>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
    let request_id = ctx.request_id.clone();

    let handle = tokio::spawn(async move {
        let mut driver = TurnDriver::new(tags, registry, ctx);
        let mut cancelled = false;
        let mut error = None;

        loop {
            tokio::select! {
                biased;
                _ = disconnect_rx.changed() => {
                    cancelled = true;
                    break;
                }
                item = upstream.next() => match item {
                    Some(Ok(delta)) => {
                        let chunks = driver.feed(&delta);
                        driver.dispatch_pending_blocking().await;
                        if !forward(&tx, chunks).await {
                            cancelled = true;
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        crate::log_error!("[{}] Upstream failed: {}", request_id, e);
                        error = Some(e.to_string());
                        // withheld prose is dropped, an open span is still reported
                        driver.finish();
                        driver.dispatch_pending_blocking().await;
                        let _ = tx.send(ChatResponse::ModelError(e)).await;
                        break;
                    }
                    None => {
                        let chunks = driver.finish();
                        driver.dispatch_pending_blocking().await;
                        if forward(&tx, chunks).await {
                            let _ = tx.send(ChatResponse::Done).await;
                        } else {
                            cancelled = true;
                        }
                        break;
                    }
                }
            }
        }
        drop(upstream);

        if cancelled {
            crate::log_info!("[{}] Client disconnected, turn cancelled", request_id);
        }
        log_tool_results(driver.tool_results());
        let mut outcome = driver.into_outcome();
        outcome.cancelled = cancelled;
        outcome.error = error;
        outcome
    });

    (Streamer::new(rx, disconnect_tx), handle)
}
