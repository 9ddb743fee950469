//! Shared test fixtures: a provider that replays scripted rounds.

use async_trait::async_trait;
use datasage_core::error::ProviderError;
use datasage_core::provider::{
    DeltaReceiver, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamDelta,
    ToolCallDelta,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};

enum StreamScript {
    Items(Vec<Result<StreamDelta, ProviderError>>),
    /// Send the items, then keep the stream open until the receiver drops.
    Hanging(Vec<StreamDelta>),
    Fail(ProviderError),
}

#[derive(Default)]
struct Inner {
    streams: Mutex<VecDeque<StreamScript>>,
    completions: Mutex<VecDeque<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
    closed: Notify,
}

/// Replays one script per `stream()` call and one response per `complete()`.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<Inner>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(self, deltas: Vec<StreamDelta>) -> Self {
        self.stream_items(deltas.into_iter().map(Ok).collect())
    }

    pub fn stream_items(self, items: Vec<Result<StreamDelta, ProviderError>>) -> Self {
        self.push_stream(StreamScript::Items(items))
    }

    pub fn hanging_stream(self, deltas: Vec<StreamDelta>) -> Self {
        self.push_stream(StreamScript::Hanging(deltas))
    }

    pub fn reject_stream(self) -> Self {
        self.fail_stream(ProviderError::StreamingUnsupported(
            "organization must be verified to stream this model".into(),
        ))
    }

    pub fn fail_stream(self, error: ProviderError) -> Self {
        self.push_stream(StreamScript::Fail(error))
    }

    pub fn complete(self, response: ProviderResponse) -> Self {
        lock(&self.inner.completions).push_back(response);
        self
    }

    fn push_stream(self, script: StreamScript) -> Self {
        lock(&self.inner.streams).push_back(script);
        self
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        lock(&self.inner.requests).clone()
    }

    /// Resolves once a hanging stream's receiver has been dropped.
    pub async fn wait_stream_closed(&self) {
        self.inner.closed.notified().await;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        lock(&self.inner.requests).push(request);
        lock(&self.inner.completions)
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("no scripted completion left".into()))
    }

    async fn stream(&self, request: ProviderRequest) -> Result<DeltaReceiver, ProviderError> {
        lock(&self.inner.requests).push(request);
        let script = lock(&self.inner.streams)
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidResponse("no scripted stream left".into()))?;
        match script {
            StreamScript::Fail(e) => Err(e),
            StreamScript::Items(items) => {
                let (tx, rx) = mpsc::channel(items.len().max(1));
                for item in items {
                    let _ = tx.send(item).await;
                }
                Ok(rx)
            }
            StreamScript::Hanging(deltas) => {
                let (tx, rx) = mpsc::channel(deltas.len().max(1));
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    for delta in deltas {
                        let _ = tx.send(Ok(delta)).await;
                    }
                    tx.closed().await;
                    inner.closed.notify_one();
                });
                Ok(rx)
            }
        }
    }
}

pub fn request() -> ProviderRequest {
    ProviderRequest {
        model: "gpt-5-mini".into(),
        system: Some("You are a data analyst.".into()),
        messages: vec![datasage_core::message::Message::user("How many customers?")],
        temperature: 0.2,
        max_tokens: None,
        tools: vec![],
        stream: true,
    }
}

pub fn content(text: &str) -> StreamDelta {
    StreamDelta {
        content: Some(text.into()),
        ..Default::default()
    }
}

pub fn finish(reason: FinishReason) -> StreamDelta {
    StreamDelta {
        finish_reason: Some(reason),
        ..Default::default()
    }
}

pub fn tool_fragment(index: usize, id: Option<&str>, name: Option<&str>, arguments: &str) -> StreamDelta {
    StreamDelta {
        tool_calls: vec![ToolCallDelta {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: Some(arguments.into()),
        }],
        ..Default::default()
    }
}

/// One complete tool round asking for `name` with `arguments`.
pub fn tool_round(id: &str, name: &str, arguments: &str) -> Vec<StreamDelta> {
    vec![
        tool_fragment(0, Some(id), Some(name), arguments),
        finish(FinishReason::ToolCalls),
    ]
}

/// One complete text round.
pub fn text_round(text: &str) -> Vec<StreamDelta> {
    vec![content(text), finish(FinishReason::Stop)]
}
