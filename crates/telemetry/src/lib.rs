//! Best-effort tracing of agent turns.
//!
//! The agent loop reports turn, generation and tool events to a
//! [`TraceSink`]. [`TelemetryEngine`] keeps recent traces in memory for the
//! HTTP API; [`LangfuseSink`] exports them when Langfuse keys are configured.

pub mod engine;
pub mod langfuse;
pub mod model;
pub mod sink;

use datasage_config::TracingConfig;
use std::sync::Arc;
use tracing::{info, warn};

pub use engine::TelemetryEngine;
pub use langfuse::LangfuseSink;
pub use model::{Span, SpanKind, Trace, UsageSnapshot};
pub use sink::{
    FanoutSink, GenerationRecord, NoopSink, ToolSpanRecord, TraceSink, TurnEnd, TurnStart,
};

/// The sink used by the agent: the in-memory engine, plus Langfuse export
/// when it is enabled and can be initialized.
pub fn build_sink(config: &TracingConfig, engine: Arc<TelemetryEngine>) -> FanoutSink {
    let engine: Arc<dyn TraceSink> = engine;
    let mut fanout = FanoutSink::new(vec![engine]);
    if let (true, Some(public), Some(secret)) = (
        config.langfuse_enabled(),
        config.langfuse_public_key.as_deref(),
        config.langfuse_secret_key.as_deref(),
    ) {
        match LangfuseSink::new(&config.langfuse_host, public, secret) {
            Ok(sink) => {
                info!(host = %config.langfuse_host, "Langfuse export enabled");
                fanout.push(Arc::new(sink));
            }
            Err(e) => warn!(error = %e, "Langfuse export unavailable; continuing without it"),
        }
    }
    fanout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn langfuse_added_only_with_keys() {
        let engine = Arc::new(TelemetryEngine::new());
        assert_eq!(build_sink(&TracingConfig::default(), engine.clone()).len(), 1);

        let with_keys = TracingConfig {
            langfuse_public_key: Some("pk".into()),
            langfuse_secret_key: Some("sk".into()),
            ..TracingConfig::default()
        };
        assert_eq!(build_sink(&with_keys, engine.clone()).len(), 2);

        let disabled = TracingConfig {
            enabled: false,
            ..with_keys
        };
        assert_eq!(build_sink(&disabled, engine).len(), 1);
    }
}
