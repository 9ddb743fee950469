//! The agent turn loop.

use crate::aggregator::{Aggregation, Outcome, aggregate};
use crate::dispatcher::{ToolDispatcher, parse_arguments};
use crate::prompt::system_prompt;
use chrono::Utc;
use datasage_core::error::SessionError;
use datasage_core::event::StreamEvent;
use datasage_core::message::{Message, Timing, ToolCallRecord};
use datasage_core::provider::{Provider, ProviderRequest};
use datasage_sessions::SessionStore;
use datasage_telemetry::{GenerationRecord, NoopSink, ToolSpanRecord, TraceSink, TurnEnd, TurnStart};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered events between the turn task and the client.
const EVENT_BUFFER: usize = 64;

/// Where a turn is.
#[derive(Debug)]
enum TurnState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCallRecord>),
    Finalizing {
        aggregation: Aggregation,
        model: String,
        timing: Timing,
    },
    Done(String),
    Error(String),
    Cancelled,
}

/// Runs turns for sessions: model calls, tool rounds, persistence and events.
pub struct AgentLoop {
    /// The LLM provider to use
    provider: Arc<dyn Provider>,

    /// Durable message log every step is reconciled through
    store: Arc<SessionStore>,

    dispatcher: Arc<ToolDispatcher>,

    tracer: Arc<dyn TraceSink>,

    /// Default model; a session's selected model overrides it
    model: String,

    temperature: f32,

    max_tokens: Option<u32>,

    system_prompt: String,

    /// Maximum tool rounds per turn
    max_iterations: usize,

    /// Piece size for replaying non-streamed text
    fallback_chunk_size: usize,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<SessionStore>,
        dispatcher: Arc<ToolDispatcher>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            dispatcher,
            tracer: Arc::new(NoopSink),
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            system_prompt: system_prompt(None),
            max_iterations: 25,
            fallback_chunk_size: 48,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: Option<u32>) -> Self {
        self.max_tokens = max;
        self
    }

    /// Replace the system instruction. `None` keeps the built-in one.
    pub fn with_system_prompt(mut self, prompt: Option<&str>) -> Self {
        self.system_prompt = system_prompt(prompt);
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_fallback_chunk_size(mut self, size: usize) -> Self {
        self.fallback_chunk_size = size.max(1);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn TraceSink>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Append a user message and start a turn for it.
    pub async fn chat(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, SessionError> {
        self.store
            .append(session_id, Message::user(text), Utc::now())
            .await?;
        Ok(self.run_turn(session_id, cancel))
    }

    /// Start a turn over the session's current history.
    ///
    /// The turn runs in its own task. The receiver yields its events and
    /// closes after the terminal `Done` or `Error`; a cancelled turn closes
    /// without one.
    pub fn run_turn(
        self: &Arc<Self>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            this.drive(&session_id, tx, cancel).await;
        });
        rx
    }

    async fn drive(&self, session_id: &str, events: mpsc::Sender<StreamEvent>, cancel: CancellationToken) {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let input = self
            .store
            .get_messages(session_id)
            .await
            .into_iter()
            .rev()
            .find_map(|m| match m {
                Message::User { content } => Some(content),
                _ => None,
            })
            .unwrap_or_default();
        info!(session_id, trace_id, "Starting turn");
        self.tracer.turn_started(&TurnStart {
            trace_id: trace_id.clone(),
            session_id: session_id.to_string(),
            input,
            at: Utc::now(),
        });

        let mut rounds = 0usize;
        let mut state = TurnState::AwaitingModel;
        let end = loop {
            state = match state {
                TurnState::AwaitingModel => {
                    self.await_model(session_id, &trace_id, &events, &cancel, &mut rounds)
                        .await
                }
                TurnState::ExecutingTools(calls) => {
                    self.execute_tools(session_id, &trace_id, calls, &events, &cancel)
                        .await
                }
                TurnState::Finalizing {
                    aggregation,
                    model,
                    timing,
                } => self.finalize(session_id, aggregation, model, timing).await,
                TurnState::Done(answer) => {
                    let _ = events.send(StreamEvent::Done).await;
                    break TurnEnd {
                        trace_id: trace_id.clone(),
                        output: Some(answer),
                        error: None,
                        at: Utc::now(),
                    };
                }
                TurnState::Error(message) => {
                    warn!(session_id, error = %message, "Turn failed");
                    let _ = events.send(StreamEvent::Error(message.clone())).await;
                    break TurnEnd {
                        trace_id: trace_id.clone(),
                        output: None,
                        error: Some(message),
                        at: Utc::now(),
                    };
                }
                TurnState::Cancelled => {
                    info!(session_id, "Turn cancelled by client");
                    break TurnEnd {
                        trace_id: trace_id.clone(),
                        output: None,
                        error: Some("cancelled".into()),
                        at: Utc::now(),
                    };
                }
            };
        };

        // Closing the channel ends the client's stream before telemetry flushes.
        drop(events);
        self.tracer.turn_ended(&end);
        self.tracer.flush().await;
    }

    async fn await_model(
        &self,
        session_id: &str,
        trace_id: &str,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        rounds: &mut usize,
    ) -> TurnState {
        let Some(session) = self.store.get(session_id).await else {
            return TurnState::Error(format!("Session not found: {session_id}"));
        };
        let model = session.model.clone().unwrap_or_else(|| self.model.clone());
        let request = ProviderRequest {
            model: model.clone(),
            system: Some(self.system_prompt.clone()),
            messages: session.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.dispatcher.definitions(),
            stream: true,
        };
        let generation_input = json!({"messages": request.messages.len(), "last": request.messages.last()});

        let started_at = Utc::now();
        let clock = Instant::now();
        debug!(session_id, model, messages = request.messages.len(), "Requesting model response");
        let outcome = aggregate(
            self.provider.as_ref(),
            request,
            events,
            self.fallback_chunk_size,
            cancel,
        )
        .await;
        let timing = Timing {
            started_at,
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let aggregation = match outcome {
            Ok(Outcome::Completed(aggregation)) => aggregation,
            Ok(Outcome::Cancelled) => return TurnState::Cancelled,
            Err(e) => return TurnState::Error(e.to_string()),
        };
        let model = aggregation.model.clone().unwrap_or(model);
        if aggregation.fell_back {
            debug!(session_id, model, "Model answered through the non-streaming fallback");
        }

        self.tracer.generation(&GenerationRecord {
            trace_id: trace_id.to_string(),
            model: model.clone(),
            input: generation_input,
            output: json!({
                "content": aggregation.content,
                "tool_calls": aggregation.tool_calls,
            }),
            usage: aggregation.usage,
            start: started_at,
            end: Utc::now(),
        });

        if !aggregation.is_tool_round() {
            return TurnState::Finalizing {
                aggregation,
                model,
                timing,
            };
        }

        *rounds += 1;
        if *rounds > self.max_iterations {
            return TurnState::Error(format!(
                "Stopped after {} tool rounds without a final answer",
                self.max_iterations
            ));
        }

        let reasoning = aggregation.reasoning_opt();
        let calls = aggregation.tool_calls.clone();
        let message = Message::assistant_tool_calls(
            Some(aggregation.content),
            aggregation.tool_calls,
            reasoning,
            Some(model),
            Some(timing),
        );
        if let Err(e) = self.store.append(session_id, message, Utc::now()).await {
            return persistence_error(e);
        }
        for call in &calls {
            let _ = events
                .send(StreamEvent::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    arguments: parse_arguments(&call.arguments),
                })
                .await;
        }
        TurnState::ExecutingTools(calls)
    }

    /// Dispatch one round in model order. A persisted round always runs to
    /// completion so no tool call is left without its result.
    async fn execute_tools(
        &self,
        session_id: &str,
        trace_id: &str,
        calls: Vec<ToolCallRecord>,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> TurnState {
        for call in calls {
            let history = self.store.get_messages(session_id).await;
            let start = Utc::now();
            let output = self
                .dispatcher
                .dispatch(&call.name, &call.arguments, &history)
                .await;
            debug!(session_id, tool = %call.name, id = %call.id, "Tool call finished");

            self.tracer.tool_span(&ToolSpanRecord {
                trace_id: trace_id.to_string(),
                name: call.name.clone(),
                input: parse_arguments(&call.arguments),
                output: output.clone(),
                start,
                end: Utc::now(),
            });

            let message = Message::tool_result(call.id.clone(), call.name.clone(), output.clone());
            if let Err(e) = self.store.append(session_id, message, Utc::now()).await {
                return persistence_error(e);
            }
            let _ = events
                .send(StreamEvent::ToolResult {
                    id: call.id,
                    name: call.name,
                    output,
                })
                .await;
        }

        if cancel.is_cancelled() {
            TurnState::Cancelled
        } else {
            TurnState::AwaitingModel
        }
    }

    async fn finalize(
        &self,
        session_id: &str,
        aggregation: Aggregation,
        model: String,
        timing: Timing,
    ) -> TurnState {
        let reasoning = aggregation.reasoning_opt();
        let answer = aggregation.content;
        let message = Message::assistant_text(answer.clone(), reasoning, Some(model), Some(timing));
        match self.store.append(session_id, message, Utc::now()).await {
            Ok(()) => TurnState::Done(answer),
            Err(e) => persistence_error(e),
        }
    }
}

fn persistence_error(e: SessionError) -> TurnState {
    TurnState::Error(format!("Failed to persist session: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, content, text_round, tool_fragment, tool_round};
    use async_trait::async_trait;
    use datasage_core::error::{ProviderError, ToolError};
    use datasage_core::provider::{FinishReason, ProviderResponse, StreamDelta};
    use datasage_core::tool::{Tool, ToolRegistry};
    use datasage_telemetry::TelemetryEngine;
    use serde_json::Value;
    use std::sync::Mutex;

    /// Records every call and its arguments; answers with canned output.
    struct ProbeTool {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "probe"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"title": {"type": "string"}}})
        }
        async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, arguments));
            Ok(json!({"ok": self.name}))
        }
    }

    struct Harness {
        agent: Arc<AgentLoop>,
        store: Arc<SessionStore>,
        provider: ScriptedProvider,
        calls: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
    }

    async fn harness(provider: ScriptedProvider) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path().join("sessions.json")).await.unwrap());
        store.create("s1", "Test", Utc::now(), None).await.unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ToolRegistry::new();
        for name in ["sql_schema", "sql_query", "write_file"] {
            registry.register(Arc::new(ProbeTool {
                name,
                calls: calls.clone(),
            }));
        }
        let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(registry)));
        let agent = Arc::new(
            AgentLoop::new(Arc::new(provider.clone()), store.clone(), dispatcher, "gpt-5-mini")
                .with_max_iterations(3),
        );
        Harness {
            agent,
            store,
            provider,
            calls,
            _dir: dir,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn chat(h: &Harness, text: &str) -> Vec<StreamEvent> {
        let rx = h.agent.chat("s1", text, CancellationToken::new()).await.unwrap();
        collect(rx).await
    }

    fn chunk_text(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn plain_answer_streams_and_persists() {
        let provider = ScriptedProvider::new().stream(vec![
            content("Hello"),
            content(" world"),
            crate::test_helpers::finish(FinishReason::Stop),
        ]);
        let h = harness(provider).await;
        let events = chat(&h, "Say hello").await;

        assert_eq!(chunk_text(&events), "Hello world");
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let messages = h.store.get_messages("s1").await;
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            Message::Assistant {
                content,
                model,
                timing,
                tool_calls,
                ..
            } => {
                assert_eq!(content.as_deref(), Some("Hello world"));
                assert_eq!(model.as_deref(), Some("gpt-5-mini"));
                assert!(timing.is_some());
                assert!(tool_calls.is_empty());
            }
            other => panic!("expected assistant message, got {other:?}"),
        }

        let request = &h.provider.requests()[0];
        assert!(request.system.as_deref().unwrap().contains("data analyst"));
        assert_eq!(request.tools.len(), 3);
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let provider = ScriptedProvider::new()
            .stream(tool_round("call_schema", "sql_schema", "{}"))
            .stream(tool_round("call_q", "sql_query", r#"{"sql":"SELECT COUNT(*) FROM customers"}"#))
            .stream(text_round("There are 50 customers."));
        let h = harness(provider).await;
        let events = chat(&h, "How many customers?").await;

        let kinds: Vec<&str> = events.iter().map(StreamEvent::event_type).collect();
        assert_eq!(
            kinds,
            vec!["tool_call", "tool_result", "tool_call", "tool_result", "chunk", "done"]
        );
        assert_eq!(
            events[2],
            StreamEvent::ToolCall {
                id: "call_q".into(),
                name: "sql_query".into(),
                arguments: json!({"sql": "SELECT COUNT(*) FROM customers"}),
            }
        );

        let roles: Vec<&str> = h.store.get_messages("s1").await.iter().map(Message::role).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant", "tool", "assistant"]);
        assert_eq!(h.calls.lock().unwrap().len(), 2);

        // Each model call sees the history persisted so far.
        let requests = h.provider.requests();
        assert_eq!(requests.iter().map(|r| r.messages.len()).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn tool_round_persists_streamed_narration() {
        let provider = ScriptedProvider::new()
            .stream(vec![
                StreamDelta {
                    reasoning: Some("schema first".into()),
                    ..Default::default()
                },
                content("Let me check the schema."),
                tool_fragment(0, Some("call_schema"), Some("sql_schema"), "{}"),
                crate::test_helpers::finish(FinishReason::ToolCalls),
            ])
            .stream(text_round("There are four tables."));
        let h = harness(provider).await;
        let events = chat(&h, "What tables exist?").await;
        assert_eq!(chunk_text(&events), "Let me check the schema.There are four tables.");

        let messages = h.store.get_messages("s1").await;
        match &messages[1] {
            Message::Assistant {
                content,
                reasoning,
                tool_calls,
                ..
            } => {
                assert_eq!(content.as_deref(), Some("Let me check the schema."));
                assert_eq!(reasoning.as_deref(), Some("schema first"));
                assert_eq!(tool_calls[0].name, "sql_schema");
            }
            other => panic!("expected assistant tool round, got {other:?}"),
        }

        // The follow-up request carries the narration back to the model.
        let requests = h.provider.requests();
        assert_eq!(requests[1].messages[1], messages[1]);
    }

    /// Holds every flush until released, recording that it began.
    struct StalledFlushSink {
        flushing: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl TraceSink for StalledFlushSink {
        fn turn_started(&self, _: &TurnStart) {}
        fn generation(&self, _: &GenerationRecord) {}
        fn tool_span(&self, _: &ToolSpanRecord) {}
        fn turn_ended(&self, _: &TurnEnd) {}
        async fn flush(&self) {
            self.flushing.notify_one();
            self.release.notified().await;
        }
    }

    #[tokio::test]
    async fn stream_closes_before_telemetry_flush() {
        let h = harness(ScriptedProvider::new().stream(text_round("ok"))).await;
        let flushing = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let agent = Arc::new(
            AgentLoop::new(
                Arc::new(h.provider.clone()),
                h.store.clone(),
                Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new()))),
                "gpt-5-mini",
            )
            .with_tracer(Arc::new(StalledFlushSink {
                flushing: flushing.clone(),
                release: release.clone(),
            })),
        );

        let rx = agent.chat("s1", "Hi", CancellationToken::new()).await.unwrap();
        let events = tokio::time::timeout(std::time::Duration::from_secs(2), collect(rx))
            .await
            .expect("stream should end while the flush is still pending");
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        flushing.notified().await;
        release.notify_one();
    }

    #[tokio::test]
    async fn query_before_schema_continues_the_turn() {
        let provider = ScriptedProvider::new()
            .stream(tool_round("call_q", "sql_query", r#"{"sql":"SELECT 1"}"#))
            .stream(text_round("Let me look at the schema first."));
        let h = harness(provider).await;
        let events = chat(&h, "Top products?").await;

        let result = events
            .iter()
            .find_map(|e| match e {
                StreamEvent::ToolResult { output, .. } => Some(output.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(result["error"], "schema_required");
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        assert!(h.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn two_calls_in_one_round_run_in_model_order() {
        let provider = ScriptedProvider::new()
            .stream(vec![
                tool_fragment(0, Some("a"), Some("sql_schema"), "{}"),
                tool_fragment(1, Some("b"), Some("write_file"), r#"{"path":"out.md","#),
                tool_fragment(1, None, None, r#""content":"x"}"#),
                crate::test_helpers::finish(FinishReason::ToolCalls),
            ])
            .stream(text_round("Saved."));
        let h = harness(provider).await;
        chat(&h, "Write a report").await;

        let calls = h.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("sql_schema"));
        assert!(calls[1].starts_with("write_file"));

        let messages = h.store.get_messages("s1").await;
        let ids: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                Message::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn provider_error_ends_with_single_error() {
        let provider = ScriptedProvider::new().fail_stream(ProviderError::AuthenticationFailed(
            "invalid api key".into(),
        ));
        let h = harness(provider).await;
        let events = chat(&h, "Hi").await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(m) if m.contains("invalid api key")));
        assert_eq!(h.store.get_messages("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn fallback_is_invisible_in_content() {
        let provider = ScriptedProvider::new()
            .reject_stream()
            .complete(ProviderResponse {
                content: Some("Denver has the most customers.".into()),
                finish_reason: Some(FinishReason::Stop),
                model: "gpt-5".into(),
                ..Default::default()
            });
        let h = harness(provider).await;
        let events = chat(&h, "Which city?").await;
        assert_eq!(chunk_text(&events), "Denver has the most customers.");
        assert_eq!(events.last(), Some(&StreamEvent::Done));
        match h.store.get_messages("s1").await.last().unwrap() {
            Message::Assistant { model, .. } => assert_eq!(model.as_deref(), Some("gpt-5")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_rounds_are_bounded() {
        let mut provider = ScriptedProvider::new();
        for i in 0..4 {
            provider = provider.stream(tool_round(&format!("c{i}"), "sql_schema", "{}"));
        }
        let h = harness(provider).await;
        let events = chat(&h, "Loop forever").await;
        assert!(matches!(events.last(), Some(StreamEvent::Error(m)) if m.contains("3 tool rounds")));
        // Three full rounds persisted, the fourth dropped.
        let tools = h
            .store
            .get_messages("s1")
            .await
            .iter()
            .filter(|m| m.role() == "tool")
            .count();
        assert_eq!(tools, 3);
    }

    #[tokio::test]
    async fn session_model_overrides_default() {
        let provider = ScriptedProvider::new().stream(text_round("ok"));
        let h = harness(provider).await;
        h.store
            .update_model("s1", Some("openai/gpt-4o".into()), Utc::now())
            .await
            .unwrap();
        chat(&h, "Hi").await;
        assert_eq!(h.provider.requests()[0].model, "openai/gpt-4o");
    }

    #[tokio::test]
    async fn cancelled_stream_persists_nothing() {
        let provider = ScriptedProvider::new().hanging_stream(vec![content("Partial")]);
        let h = harness(provider).await;
        let cancel = CancellationToken::new();
        let mut rx = h.agent.chat("s1", "Hi", cancel.clone()).await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamEvent::Chunk("Partial".into())));
        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        h.provider.wait_stream_closed().await;
        assert_eq!(h.store.get_messages("s1").await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_during_tools_finishes_round_then_stops() {
        let provider = ScriptedProvider::new()
            .stream(vec![
                tool_fragment(0, Some("a"), Some("sql_schema"), "{}"),
                tool_fragment(1, Some("b"), Some("sql_schema"), "{}"),
                crate::test_helpers::finish(FinishReason::ToolCalls),
            ])
            .stream(text_round("never requested"));
        let h = harness(provider).await;
        let cancel = CancellationToken::new();
        let mut rx = h.agent.chat("s1", "Hi", cancel.clone()).await.unwrap();
        // Cancel as soon as the round is announced.
        assert!(matches!(rx.recv().await, Some(StreamEvent::ToolCall { .. })));
        cancel.cancel();
        while rx.recv().await.is_some() {}

        let roles: Vec<&str> = h.store.get_messages("s1").await.iter().map(Message::role).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "tool"]);
        assert_eq!(h.provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn turns_are_traced() {
        let provider = ScriptedProvider::new()
            .stream(tool_round("a", "sql_schema", "{}"))
            .stream(vec![
                content("Done"),
                StreamDelta {
                    finish_reason: Some(FinishReason::Stop),
                    usage: Some(datasage_core::provider::Usage {
                        prompt_tokens: 12,
                        completion_tokens: 3,
                        total_tokens: 15,
                    }),
                    ..Default::default()
                },
            ]);
        let h = harness(provider).await;
        let engine = Arc::new(TelemetryEngine::new());
        let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new())).with_gate(None));
        let agent = Arc::new(
            AgentLoop::new(Arc::new(h.provider.clone()), h.store.clone(), dispatcher, "gpt-5-mini")
                .with_tracer(engine.clone()),
        );
        collect(agent.chat("s1", "Trace me", CancellationToken::new()).await.unwrap()).await;

        let traces = engine.traces_for_session("s1");
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.input, "Trace me");
        assert_eq!(trace.output.as_deref(), Some("Done"));
        assert_eq!(trace.llm_call_count(), 2);
        assert_eq!(trace.tool_execution_count(), 1);
        assert_eq!(trace.total_tokens(), 15);
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let h = harness(ScriptedProvider::new()).await;
        let events = collect(h.agent.run_turn("missing", CancellationToken::new())).await;
        assert!(matches!(&events[..], [StreamEvent::Error(m)] if m.contains("missing")));
    }
}
