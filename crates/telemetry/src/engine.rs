//! Thread-safe in-memory telemetry engine: keeps recent traces and running
//! totals, and serves them to the HTTP layer.

use crate::model::*;
use crate::sink::{GenerationRecord, ToolSpanRecord, TraceSink, TurnEnd, TurnStart};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

/// Traces kept before the oldest are dropped.
pub const DEFAULT_MAX_TRACES: usize = 500;

/// The in-memory trace sink.
///
/// Spans are attached to their trace by id; events for unknown traces only
/// update the totals.
pub struct TelemetryEngine {
    max_traces: usize,
    /// Most recent last.
    traces: RwLock<VecDeque<Trace>>,
    totals: RwLock<RunningTotals>,
}

#[derive(Debug, Default)]
struct RunningTotals {
    turns: u64,
    failed_turns: u64,
    llm_calls: u64,
    tool_executions: u64,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl TelemetryEngine {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_TRACES)
    }

    pub fn with_capacity(max_traces: usize) -> Self {
        Self {
            max_traces: max_traces.max(1),
            traces: RwLock::new(VecDeque::new()),
            totals: RwLock::new(RunningTotals::default()),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.iter().find(|t| t.id == trace_id).cloned()
    }

    /// Recent traces, most recent first.
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces.iter().rev().take(limit).cloned().collect()
    }

    pub fn traces_for_session(&self, session_id: &str) -> Vec<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        traces
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn trace_count(&self) -> usize {
        self.traces.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let totals = self.totals.read().unwrap_or_else(PoisonError::into_inner);
        UsageSnapshot {
            turns: totals.turns,
            failed_turns: totals.failed_turns,
            llm_calls: totals.llm_calls,
            tool_executions: totals.tool_executions,
            prompt_tokens: totals.prompt_tokens,
            completion_tokens: totals.completion_tokens,
            trace_count: self.trace_count() as u64,
        }
    }

    // ── Recording ─────────────────────────────────────────────────────

    fn with_trace(&self, trace_id: &str, f: impl FnOnce(&mut Trace)) {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(trace) = traces.iter_mut().rev().find(|t| t.id == trace_id) {
            f(trace);
        }
    }

    fn with_totals(&self, f: impl FnOnce(&mut RunningTotals)) {
        f(&mut self.totals.write().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Default for TelemetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TraceSink for TelemetryEngine {
    fn turn_started(&self, event: &TurnStart) {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        // Prune the oldest, preferring finished traces.
        while traces.len() >= self.max_traces {
            match traces.iter().position(Trace::is_finished) {
                Some(pos) => traces.remove(pos),
                None => traces.pop_front(),
            };
        }
        traces.push_back(Trace::new(
            event.trace_id.clone(),
            event.session_id.clone(),
            event.input.clone(),
            event.at,
        ));
        drop(traces);
        self.with_totals(|t| t.turns += 1);
    }

    fn generation(&self, record: &GenerationRecord) {
        let mut span = Span::completed(SpanKind::LlmCall, &record.model, record.start, record.end);
        span.usage = record.usage;
        span.output = record.output.clone();
        self.with_totals(|t| {
            t.llm_calls += 1;
            if let Some(usage) = record.usage {
                t.prompt_tokens += u64::from(usage.prompt_tokens);
                t.completion_tokens += u64::from(usage.completion_tokens);
            }
        });
        self.with_trace(&record.trace_id, |trace| trace.add_span(span));
    }

    fn tool_span(&self, record: &ToolSpanRecord) {
        let mut span =
            Span::completed(SpanKind::ToolExecution, &record.name, record.start, record.end);
        span.input = record.input.clone();
        span.output = record.output.clone();
        self.with_totals(|t| t.tool_executions += 1);
        self.with_trace(&record.trace_id, |trace| trace.add_span(span));
    }

    fn turn_ended(&self, event: &TurnEnd) {
        if event.error.is_some() {
            self.with_totals(|t| t.failed_turns += 1);
        }
        self.with_trace(&event.trace_id, |trace| {
            trace.ended_at = Some(event.at);
            trace.output = event.output.clone();
            trace.error = event.error.clone();
            let turn = Span::completed(SpanKind::Turn, "turn", trace.started_at, event.at);
            trace.add_span(turn);
        });
    }
}
