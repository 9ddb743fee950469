//! Data model for turn traces and their spans.

use chrono::{DateTime, Utc};
use datasage_core::provider::Usage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// Top-level turn (user message to final answer).
    Turn,
    /// One model generation.
    LlmCall,
    /// One dispatched tool call.
    ToolExecution,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Turn => write!(f, "turn"),
            Self::LlmCall => write!(f, "llm_call"),
            Self::ToolExecution => write!(f, "tool_execution"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: SpanKind,
    /// Tool name or model id.
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
}

impl Span {
    /// A finished span covering `started_at..ended_at`.
    pub fn completed(
        kind: SpanKind,
        label: impl Into<String>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            started_at,
            ended_at,
            duration_ms: ended_at
                .signed_duration_since(started_at)
                .num_milliseconds()
                .max(0) as u64,
            usage: None,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.usage.map(|u| u.total_tokens).unwrap_or(0)
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All spans of one conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub session_id: String,
    pub input: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub spans: Vec<Span>,
}

impl Trace {
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        input: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            input: input.into(),
            started_at,
            ended_at: None,
            output: None,
            error: None,
            spans: Vec::new(),
        }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Total tokens across all generations in this trace.
    pub fn total_tokens(&self) -> u32 {
        self.spans.iter().map(|s| s.total_tokens()).sum()
    }

    /// Number of model generations in this trace.
    pub fn llm_call_count(&self) -> usize {
        self.count(SpanKind::LlmCall)
    }

    /// Number of tool executions in this trace.
    pub fn tool_execution_count(&self) -> usize {
        self.count(SpanKind::ToolExecution)
    }

    fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }
}

// ── Usage snapshot ────────────────────────────────────────────────────────

/// Running totals since process start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub turns: u64,
    pub failed_turns: u64,
    pub llm_calls: u64,
    pub tool_executions: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub trace_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn span_duration_from_bounds() {
        let start = Utc::now();
        let span = Span::completed(SpanKind::ToolExecution, "sql_query", start, start + Duration::milliseconds(250));
        assert_eq!(span.duration_ms, 250);

        let backwards = Span::completed(SpanKind::LlmCall, "m", start, start - Duration::seconds(1));
        assert_eq!(backwards.duration_ms, 0);
    }

    #[test]
    fn trace_counts_by_kind() {
        let now = Utc::now();
        let mut trace = Trace::new("t1", "s1", "How many orders?", now);
        let mut gen_span = Span::completed(SpanKind::LlmCall, "gpt-5-mini", now, now);
        gen_span.usage = Some(Usage {
            prompt_tokens: 100,
            completion_tokens: 20,
            total_tokens: 120,
        });
        trace.add_span(gen_span);
        trace.add_span(Span::completed(SpanKind::ToolExecution, "sql_schema", now, now));
        trace.add_span(Span::completed(SpanKind::ToolExecution, "sql_query", now, now));

        assert_eq!(trace.llm_call_count(), 1);
        assert_eq!(trace.tool_execution_count(), 2);
        assert_eq!(trace.total_tokens(), 120);
        assert!(!trace.is_finished());
    }

    #[test]
    fn span_kind_serializes_snake_case() {
        assert_eq!(serde_json::to_value(SpanKind::ToolExecution).unwrap(), "tool_execution");
        assert_eq!(SpanKind::LlmCall.to_string(), "llm_call");
    }
}
