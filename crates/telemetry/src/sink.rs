//! The trace sink seam between the agent loop and telemetry backends.
//!
//! Every method is infallible: a sink swallows its own failures, so
//! emitting telemetry can never change how a turn runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datasage_core::provider::Usage;
use serde_json::Value;
use std::sync::Arc;

/// A turn began for a user message.
#[derive(Debug, Clone)]
pub struct TurnStart {
    pub trace_id: String,
    pub session_id: String,
    pub input: String,
    pub at: DateTime<Utc>,
}

/// One model generation.
#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub trace_id: String,
    pub model: String,
    pub input: Value,
    pub output: Value,
    pub usage: Option<Usage>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One dispatched tool call.
#[derive(Debug, Clone)]
pub struct ToolSpanRecord {
    pub trace_id: String,
    pub name: String,
    pub input: Value,
    pub output: Value,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A turn finished, with its final answer or the error that ended it.
#[derive(Debug, Clone)]
pub struct TurnEnd {
    pub trace_id: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait TraceSink: Send + Sync {
    fn turn_started(&self, event: &TurnStart);

    fn generation(&self, record: &GenerationRecord);

    fn tool_span(&self, record: &ToolSpanRecord);

    fn turn_ended(&self, event: &TurnEnd);

    /// Push out anything buffered. Called once at the end of each turn.
    async fn flush(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl TraceSink for NoopSink {
    fn turn_started(&self, _: &TurnStart) {}
    fn generation(&self, _: &GenerationRecord) {}
    fn tool_span(&self, _: &ToolSpanRecord) {}
    fn turn_ended(&self, _: &TurnEnd) {}
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TraceSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn TraceSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl TraceSink for FanoutSink {
    fn turn_started(&self, event: &TurnStart) {
        self.sinks.iter().for_each(|s| s.turn_started(event));
    }

    fn generation(&self, record: &GenerationRecord) {
        self.sinks.iter().for_each(|s| s.generation(record));
    }

    fn tool_span(&self, record: &ToolSpanRecord) {
        self.sinks.iter().for_each(|s| s.tool_span(record));
    }

    fn turn_ended(&self, event: &TurnEnd) {
        self.sinks.iter().for_each(|s| s.turn_ended(event));
    }

    async fn flush(&self) {
        for sink in &self.sinks {
            sink.flush().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TraceSink for Recorder {
        fn turn_started(&self, e: &TurnStart) {
            self.seen.lock().unwrap().push(format!("start:{}", e.trace_id));
        }
        fn generation(&self, r: &GenerationRecord) {
            self.seen.lock().unwrap().push(format!("gen:{}", r.model));
        }
        fn tool_span(&self, r: &ToolSpanRecord) {
            self.seen.lock().unwrap().push(format!("tool:{}", r.name));
        }
        fn turn_ended(&self, e: &TurnEnd) {
            self.seen.lock().unwrap().push(format!("end:{}", e.trace_id));
        }
        async fn flush(&self) {
            self.seen.lock().unwrap().push("flush".into());
        }
    }

    #[tokio::test]
    async fn fanout_forwards_to_every_sink() {
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let sinks: Vec<Arc<dyn TraceSink>> = vec![a.clone(), b.clone(), Arc::new(NoopSink)];
        let fanout = FanoutSink::new(sinks);
        let now = Utc::now();

        fanout.turn_started(&TurnStart {
            trace_id: "t".into(),
            session_id: "s".into(),
            input: "hi".into(),
            at: now,
        });
        fanout.tool_span(&ToolSpanRecord {
            trace_id: "t".into(),
            name: "sql_schema".into(),
            input: Value::Null,
            output: Value::Null,
            start: now,
            end: now,
        });
        fanout.turn_ended(&TurnEnd {
            trace_id: "t".into(),
            output: Some("done".into()),
            error: None,
            at: now,
        });
        fanout.flush().await;

        let expected = vec!["start:t", "tool:sql_schema", "end:t", "flush"];
        assert_eq!(*a.seen.lock().unwrap(), expected);
        assert_eq!(*b.seen.lock().unwrap(), expected);
    }
}
