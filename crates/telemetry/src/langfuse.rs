//! Langfuse exporter.
//!
//! Events are buffered in memory as ingestion events and sent in one batch
//! on [`TraceSink::flush`]. Export failures are logged at debug and the
//! batch is dropped.

use crate::sink::{GenerationRecord, ToolSpanRecord, TraceSink, TurnEnd, TurnStart};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const INGESTION_PATH: &str = "/api/public/ingestion";

pub struct LangfuseSink {
    client: reqwest::Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
    pending: Mutex<Vec<Value>>,
}

impl LangfuseSink {
    pub fn new(
        host: &str,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{INGESTION_PATH}", host.trim_end_matches('/')),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of buffered ingestion events.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn push(&self, kind: &str, body: Value) {
        let event = json!({
            "id": Uuid::new_v4().to_string(),
            "timestamp": timestamp(Utc::now()),
            "type": kind,
            "body": body,
        });
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn take_pending(&self) -> Vec<Value> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl TraceSink for LangfuseSink {
    fn turn_started(&self, event: &TurnStart) {
        self.push(
            "trace-create",
            json!({
                "id": event.trace_id,
                "name": "chat_turn",
                "sessionId": event.session_id,
                "input": event.input,
                "timestamp": timestamp(event.at),
            }),
        );
    }

    fn generation(&self, record: &GenerationRecord) {
        let usage = record.usage.map(|u| {
            json!({
                "input": u.prompt_tokens,
                "output": u.completion_tokens,
                "total": u.total_tokens,
                "unit": "TOKENS",
            })
        });
        self.push(
            "generation-create",
            json!({
                "id": Uuid::new_v4().to_string(),
                "traceId": record.trace_id,
                "name": "llm",
                "model": record.model,
                "input": record.input,
                "output": record.output,
                "usage": usage,
                "startTime": timestamp(record.start),
                "endTime": timestamp(record.end),
            }),
        );
    }

    fn tool_span(&self, record: &ToolSpanRecord) {
        self.push(
            "span-create",
            json!({
                "id": Uuid::new_v4().to_string(),
                "traceId": record.trace_id,
                "name": format!("tool:{}", record.name),
                "input": record.input,
                "output": record.output,
                "startTime": timestamp(record.start),
                "endTime": timestamp(record.end),
            }),
        );
    }

    fn turn_ended(&self, event: &TurnEnd) {
        // Re-sending trace-create with the same id updates the trace.
        let mut body = json!({
            "id": event.trace_id,
            "output": event.output,
        });
        if let Some(error) = &event.error {
            body["metadata"] = json!({ "error": error });
        }
        self.push("trace-create", body);
    }

    async fn flush(&self) {
        let batch = self.take_pending();
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let result = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&json!({ "batch": batch }))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(events = count, "Flushed Langfuse batch");
            }
            Ok(resp) => debug!(status = %resp.status(), events = count, "Langfuse rejected batch"),
            Err(e) => debug!(error = %e, events = count, "Langfuse flush failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datasage_core::provider::Usage;

    fn sink() -> LangfuseSink {
        LangfuseSink::new("https://cloud.langfuse.com/", "pk-lf-test", "sk-lf-test").unwrap()
    }

    #[test]
    fn endpoint_joins_host() {
        assert_eq!(sink().endpoint(), "https://cloud.langfuse.com/api/public/ingestion");
    }

    #[test]
    fn events_are_buffered_as_ingestion_batch() {
        let sink = sink();
        let now = Utc::now();
        sink.turn_started(&TurnStart {
            trace_id: "t1".into(),
            session_id: "s1".into(),
            input: "hi".into(),
            at: now,
        });
        sink.generation(&GenerationRecord {
            trace_id: "t1".into(),
            model: "gpt-5-mini".into(),
            input: json!([{"role": "user", "content": "hi"}]),
            output: json!("hello"),
            usage: Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
            }),
            start: now,
            end: now,
        });
        sink.tool_span(&ToolSpanRecord {
            trace_id: "t1".into(),
            name: "sql_schema".into(),
            input: json!({}),
            output: json!({"tables": []}),
            start: now,
            end: now,
        });
        sink.turn_ended(&TurnEnd {
            trace_id: "t1".into(),
            output: None,
            error: Some("boom".into()),
            at: now,
        });

        let batch = sink.take_pending();
        let kinds: Vec<&str> = batch.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["trace-create", "generation-create", "span-create", "trace-create"]);
        assert_eq!(batch[0]["body"]["sessionId"], "s1");
        assert_eq!(batch[1]["body"]["usage"]["total"], 7);
        assert_eq!(batch[1]["body"]["traceId"], "t1");
        assert_eq!(batch[2]["body"]["name"], "tool:sql_schema");
        assert_eq!(batch[3]["body"]["metadata"]["error"], "boom");
        assert_eq!(sink.pending_len(), 0);
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_is_noop() {
        sink().flush().await;
    }

    #[tokio::test]
    async fn unreachable_host_is_swallowed() {
        let sink = LangfuseSink::new("http://127.0.0.1:9", "pk", "sk").unwrap();
        sink.turn_started(&TurnStart {
            trace_id: "t".into(),
            session_id: "s".into(),
            input: "x".into(),
            at: Utc::now(),
        });
        sink.flush().await;
        assert_eq!(sink.pending_len(), 0);
    }
}
