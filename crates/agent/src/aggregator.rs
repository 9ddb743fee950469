//! Streaming delta aggregator.
//!
//! Reduces a provider's delta channel to one model round: the answer text,
//! the reasoning side text, and the tool calls reassembled from their
//! fragments. Content and reasoning are relayed to the client as they
//! arrive. When the provider refuses to stream, one non-streaming request is
//! made instead and its text is replayed as fixed-size chunks through the
//! same reduction.

use datasage_core::error::ProviderError;
use datasage_core::event::StreamEvent;
use datasage_core::message::ToolCallRecord;
use datasage_core::provider::{
    FinishReason, Provider, ProviderRequest, StreamDelta, ToolCallDelta, Usage,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A tool call being assembled from stream fragments.
#[derive(Debug, Default, Clone)]
struct ToolCallFragment {
    id: Option<String>,
    /// Set by the first fragment that carries a name, never changed after.
    name: Option<String>,
    arguments: String,
}

/// One fully reduced model round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub content: String,
    pub reasoning: String,
    /// Non-empty only when the round ended in a tool invocation.
    pub tool_calls: Vec<ToolCallRecord>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
    /// Model reported by the provider, when it reports one.
    pub model: Option<String>,
    /// Whether the non-streaming fallback produced this round.
    pub fell_back: bool,
}

impl Aggregation {
    pub fn is_tool_round(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Reasoning text, or `None` when the model produced none.
    pub fn reasoning_opt(&self) -> Option<String> {
        (!self.reasoning.is_empty()).then(|| self.reasoning.clone())
    }
}

/// How a round ended.
#[derive(Debug)]
pub enum Outcome {
    Completed(Aggregation),
    /// The turn was cancelled; nothing of this round should be kept.
    Cancelled,
}

/// Reduces deltas and relays text to the client.
pub struct StreamAggregator<'a> {
    events: &'a mpsc::Sender<StreamEvent>,
    content: String,
    reasoning: String,
    fragments: BTreeMap<usize, ToolCallFragment>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    /// Whether anything has been relayed to the client yet.
    relayed: bool,
}

impl<'a> StreamAggregator<'a> {
    pub fn new(events: &'a mpsc::Sender<StreamEvent>) -> Self {
        Self {
            events,
            content: String::new(),
            reasoning: String::new(),
            fragments: BTreeMap::new(),
            finish_reason: None,
            usage: None,
            relayed: false,
        }
    }

    /// Fold one delta in, relaying its content and reasoning.
    pub async fn apply(&mut self, delta: StreamDelta) {
        if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
            self.reasoning.push_str(&reasoning);
            self.relay(StreamEvent::Thinking(reasoning)).await;
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            self.content.push_str(&content);
            self.relay(StreamEvent::Chunk(content)).await;
        }
        for fragment in delta.tool_calls {
            self.merge_fragment(fragment);
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
        if delta.usage.is_some() {
            self.usage = delta.usage;
        }
    }

    fn merge_fragment(&mut self, delta: ToolCallDelta) {
        let entry = self.fragments.entry(delta.index).or_default();
        if entry.id.is_none() {
            entry.id = delta.id.filter(|id| !id.is_empty());
        }
        if entry.name.is_none() {
            entry.name = delta.name.filter(|name| !name.is_empty());
        }
        if let Some(arguments) = delta.arguments {
            entry.arguments.push_str(&arguments);
        }
    }

    async fn relay(&mut self, event: StreamEvent) {
        self.relayed = true;
        // A vanished client is handled through cancellation, not here.
        let _ = self.events.send(event).await;
    }

    /// Whether this round ends in tool invocation.
    ///
    /// A stream that ended without any finish reason but carried fragments
    /// is treated as a tool round too.
    fn ends_in_tools(&self) -> bool {
        match self.finish_reason {
            Some(FinishReason::ToolCalls) => !self.fragments.is_empty(),
            None => !self.fragments.is_empty(),
            Some(_) => false,
        }
    }

    pub fn finish(self) -> Aggregation {
        let tool_calls = if self.ends_in_tools() {
            self.fragments
                .into_iter()
                .map(|(index, f)| ToolCallRecord {
                    id: f.id.unwrap_or_else(|| format!("call_{index}")),
                    name: f.name.unwrap_or_default(),
                    arguments: f.arguments,
                })
                .collect()
        } else {
            if !self.fragments.is_empty() {
                warn!(
                    fragments = self.fragments.len(),
                    finish_reason = ?self.finish_reason,
                    "Discarding tool-call fragments from a non-tool round"
                );
            }
            Vec::new()
        };
        Aggregation {
            content: self.content,
            reasoning: self.reasoning,
            tool_calls,
            finish_reason: self.finish_reason,
            usage: self.usage,
            model: None,
            fell_back: false,
        }
    }
}

/// Split `text` into pieces of at most `size` characters.
pub fn split_chunks(text: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    for (count, (offset, _)) in text.char_indices().enumerate() {
        if count > 0 && count % size == 0 {
            pieces.push(&text[start..offset]);
            start = offset;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Run one model round and reduce it.
///
/// `request.stream` is ignored: the streaming path is tried first, the
/// non-streaming fallback only on a stream rejection seen before anything
/// was relayed.
pub async fn aggregate(
    provider: &dyn Provider,
    mut request: ProviderRequest,
    events: &mpsc::Sender<StreamEvent>,
    fallback_chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<Outcome, ProviderError> {
    request.stream = true;
    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
        opened = provider.stream(request.clone()) => opened,
    };

    let mut rx = match opened {
        Ok(rx) => rx,
        Err(e) if e.is_streaming_unsupported() => {
            debug!(error = %e, "Streaming rejected, falling back to a single completion");
            return fallback(provider, request, events, fallback_chunk_size, cancel).await;
        }
        Err(e) => return Err(e),
    };

    let mut aggregator = StreamAggregator::new(events);
    loop {
        let next = tokio::select! {
            // Dropping `rx` on return stops the provider's reader.
            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
            next = rx.recv() => next,
        };
        match next {
            Some(Ok(delta)) => aggregator.apply(delta).await,
            Some(Err(e)) if e.is_streaming_unsupported() && !aggregator.relayed => {
                debug!(error = %e, "Stream rejected before output, falling back");
                drop(rx);
                return fallback(provider, request, events, fallback_chunk_size, cancel).await;
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(Outcome::Completed(aggregator.finish()))
}

async fn fallback(
    provider: &dyn Provider,
    mut request: ProviderRequest,
    events: &mpsc::Sender<StreamEvent>,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<Outcome, ProviderError> {
    request.stream = false;
    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
        response = provider.complete(request) => response?,
    };

    let model = Some(response.model.clone()).filter(|m| !m.is_empty());
    let mut delta = response.into_delta();
    let content = delta.content.take().unwrap_or_default();
    let reasoning = delta.reasoning.take();

    let mut aggregator = StreamAggregator::new(events);
    aggregator
        .apply(StreamDelta {
            reasoning,
            ..Default::default()
        })
        .await;
    for piece in split_chunks(&content, chunk_size) {
        aggregator
            .apply(StreamDelta {
                content: Some(piece.to_string()),
                ..Default::default()
            })
            .await;
    }
    aggregator.apply(delta).await;

    let mut aggregation = aggregator.finish();
    aggregation.model = model;
    aggregation.fell_back = true;
    Ok(Outcome::Completed(aggregation))
}
