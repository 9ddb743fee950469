//! Client-visible turn events and their NDJSON wire form.
//!
//! A turn emits zero or more `Thinking`/`Chunk`/`ToolCall`/`ToolResult`
//! events and terminates with exactly one `Done` or one `Error`.

use serde::ser::{Serialize, SerializeMap, Serializer};

/// The unit emitted to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of the answer text
    Chunk(String),

    /// A tool call the model requested, with parsed arguments
    ToolCall {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// The output of a dispatched tool call
    ToolResult {
        id: String,
        name: String,
        output: serde_json::Value,
    },

    /// A fragment of the model's reasoning side channel
    Thinking(String),

    /// Terminal failure of the turn
    Error(String),

    /// Terminal success of the turn
    Done,
}

impl StreamEvent {
    /// Get the event type as a string (for logging).
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::Chunk(_) => "chunk",
            StreamEvent::ToolCall { .. } => "tool_call",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Thinking(_) => "thinking",
            StreamEvent::Error(_) => "error",
            StreamEvent::Done => "done",
        }
    }

    /// Serialize as one newline-terminated NDJSON line.
    pub fn to_ndjson_line(&self) -> String {
        let mut line = serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"type":"error","error":"event encoding failed: {e}"}}"#));
        line.push('\n');
        line
    }
}

impl Serialize for StreamEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StreamEvent::Chunk(text) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("chunk", text)?;
                map.end()
            }
            StreamEvent::ToolCall { id, name, arguments } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", "tool_call")?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("arguments", arguments)?;
                map.end()
            }
            StreamEvent::ToolResult { id, name, output } => {
                let mut map = serializer.serialize_map(Some(4))?;
                map.serialize_entry("type", "tool_result")?;
                map.serialize_entry("id", id)?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("output", output)?;
                map.end()
            }
            StreamEvent::Thinking(content) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "thinking")?;
                map.serialize_entry("content", content)?;
                map.end()
            }
            StreamEvent::Error(error) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "error")?;
                map.serialize_entry("error", error)?;
                map.end()
            }
            StreamEvent::Done => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("done", &true)?;
                map.end()
            }
        }
    }
}
