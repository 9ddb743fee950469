//! Session and message domain types.
//!
//! A session is the durable, append-only log of one conversation. Messages are
//! a closed variant over the three roles the agent loop ever persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tool invocation requested by the model, as persisted on the assistant
/// message that requested it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Provider-assigned call id (or a synthetic `call_{index}`)
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Raw JSON argument text exactly as the model produced it
    pub arguments: String,
}

/// Wall-clock timing of one model generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A single persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// Free text from the end user
    User { content: String },

    /// A model response: either a tool-call round or the final answer
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,

        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallRecord>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },

    /// The output of one dispatched tool call
    Tool {
        tool_call_id: String,
        name: String,
        output: serde_json::Value,
    },
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// Create a final-answer assistant message.
    pub fn assistant_text(
        content: impl Into<String>,
        reasoning: Option<String>,
        model: Option<String>,
        timing: Option<Timing>,
    ) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            reasoning,
            model,
            timing,
        }
    }

    /// Create an assistant message carrying one round of tool calls, plus
    /// any narration the model streamed before requesting them.
    pub fn assistant_tool_calls(
        content: Option<String>,
        tool_calls: Vec<ToolCallRecord>,
        reasoning: Option<String>,
        model: Option<String>,
        timing: Option<Timing>,
    ) -> Self {
        Message::Assistant {
            content: content.filter(|c| !c.is_empty()),
            tool_calls,
            reasoning,
            model,
            timing,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Message::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            output,
        }
    }

    /// The role tag this message serializes under.
    pub fn role(&self) -> &'static str {
        match self {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::Tool { .. } => "tool",
        }
    }

    /// Whether this is a tool message produced by the named tool.
    pub fn is_tool_output_of(&self, tool: &str) -> bool {
        matches!(self, Message::Tool { name, .. } if name == tool)
    }

    /// Whether this is an output of `tool` that is not an `{error, ...}` payload.
    pub fn is_successful_output_of(&self, tool: &str) -> bool {
        match self {
            Message::Tool { name, output, .. } if name == tool => output.get("error").is_none(),
            _ => false,
        }
    }
}

/// A conversation session: metadata plus its ordered message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub title: String,

    pub created_at: DateTime<Utc>,

    /// Never moves backwards
    pub updated_at: DateTime<Utc>,

    /// Model selected for this session; `None` uses the configured default
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new(title: impl Into<String>, created_at: DateTime<Utc>, model: Option<String>) -> Self {
        Self {
            title: title.into(),
            created_at,
            updated_at: created_at,
            model,
            messages: Vec::new(),
        }
    }

    /// Advance `updated_at`, ignoring timestamps older than the current one.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(at);
    }
}

/// Listing entry for a session, without its messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model: Option<String>,
}

impl SessionMeta {
    pub fn from_session(id: &str, session: &Session) -> Self {
        Self {
            id: id.to_string(),
            title: session.title.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            model: session.model.clone(),
        }
    }
}
