//! Tool dispatch: argument parsing, the schema-first gate, panic capture and
//! result caps. Dispatch never fails the turn; every failure becomes a
//! structured tool output the model can read.

use datasage_core::message::Message;
use datasage_core::provider::ToolDefinition;
use datasage_core::tool::{ResultCap, ToolRegistry};
use futures::FutureExt;
use serde_json::{Map, Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No tool named '{0}' is registered")]
    UnknownTool(String),

    #[error("Call {introspection} before {guarded} in this session")]
    SchemaRequired { guarded: String, introspection: String },

    #[error("Tool '{tool}' raised: {message}")]
    ToolException { tool: String, message: String },
}

impl DispatchError {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::UnknownTool(_) => "unknown_tool",
            DispatchError::SchemaRequired { .. } => "schema_required",
            DispatchError::ToolException { .. } => "tool_exception",
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}

/// A tool that may only run once another tool has produced a non-error
/// output in the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaGate {
    pub introspection: String,
    pub guarded: String,
}

impl Default for SchemaGate {
    fn default() -> Self {
        Self {
            introspection: "sql_schema".into(),
            guarded: "sql_query".into(),
        }
    }
}

impl SchemaGate {
    fn admits(&self, tool: &str, history: &[Message]) -> bool {
        tool != self.guarded || history.iter().any(|m| m.is_successful_output_of(&self.introspection))
    }
}

/// Parse model-produced argument text. Anything that is not a JSON object
/// becomes `{}`.
pub fn parse_arguments(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            if !raw.trim().is_empty() {
                debug!(raw, "Tool arguments are not a JSON object, using {{}}");
            }
            Value::Object(Map::new())
        }
    }
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    gate: Option<SchemaGate>,
}

impl ToolDispatcher {
    /// A dispatcher with the default schema gate.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            gate: Some(SchemaGate::default()),
        }
    }

    /// Replace the gate; `None` disables it.
    pub fn with_gate(mut self, gate: Option<SchemaGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke `name` with raw argument text against the session `history`.
    ///
    /// Errors a tool reports itself are part of its output and come back as
    /// `Ok`; only dispatch-level failures are `Err`.
    pub async fn invoke(
        &self,
        name: &str,
        raw_arguments: &str,
        history: &[Message],
    ) -> Result<Value, DispatchError> {
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::UnknownTool(name.to_string()))?;

        if let Some(gate) = &self.gate
            && !gate.admits(name, history)
        {
            return Err(DispatchError::SchemaRequired {
                guarded: gate.guarded.clone(),
                introspection: gate.introspection.clone(),
            });
        }

        let arguments = parse_arguments(raw_arguments);
        let result = AssertUnwindSafe(tool.execute(arguments))
            .catch_unwind()
            .await
            .map_err(|panic| DispatchError::ToolException {
                tool: name.to_string(),
                message: panic_message(panic.as_ref()),
            })?;

        Ok(match result {
            Ok(output) => match tool.result_cap() {
                Some(cap) => apply_cap(output, cap),
                None => output,
            },
            Err(e) => {
                debug!(tool = name, error = %e, "Tool reported an error");
                e.to_payload()
            }
        })
    }

    /// Like [`invoke`](Self::invoke), folding dispatch errors into their payloads.
    pub async fn dispatch(&self, name: &str, raw_arguments: &str, history: &[Message]) -> Value {
        match self.invoke(name, raw_arguments, history).await {
            Ok(output) => output,
            Err(e) => {
                warn!(tool = name, kind = e.kind(), error = %e, "Tool dispatch failed");
                e.to_payload()
            }
        }
    }
}

fn apply_cap(mut output: Value, cap: ResultCap) -> Value {
    let Some(object) = output.as_object_mut() else {
        return output;
    };
    let truncated = match object.get_mut(cap.field).and_then(Value::as_array_mut) {
        Some(items) if items.len() > cap.max_items => {
            items.truncate(cap.max_items);
            true
        }
        _ => false,
    };
    if truncated {
        object.insert("truncated".into(), Value::Bool(true));
    }
    output
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}
