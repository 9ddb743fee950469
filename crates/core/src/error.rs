//! Error types for the Datasage domain.
//!
//! Each bounded context has its own `thiserror` enum. Request validation
//! lives at the HTTP edge, configuration errors in the config crate.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    /// The provider refused a streaming request; a non-streaming call with
    /// identical parameters may still succeed.
    #[error("Streaming not permitted for this request: {0}")]
    StreamingUnsupported(String),

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether the streaming → non-streaming fallback applies to this error.
    pub fn is_streaming_unsupported(&self) -> bool {
        matches!(self, ProviderError::StreamingUnsupported(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session file I/O failed at {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Session file {path} is not a valid snapshot: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Permission denied: {tool_name}: {reason}")]
    PermissionDenied { tool_name: String, reason: String },

    #[error("Path escapes workspace: {0}")]
    PathEscapesWorkspace(String),

    #[error("Not found: {0}")]
    ResourceNotFound(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    /// Stable machine-readable kind used in `{"error": kind}` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "unknown_tool",
            ToolError::ExecutionFailed { .. } => "execution_failed",
            ToolError::PermissionDenied { .. } => "permission_denied",
            ToolError::PathEscapesWorkspace(_) => "path_escapes_workspace",
            ToolError::ResourceNotFound(_) => "not_found",
            ToolError::InvalidArguments(_) => "invalid_arguments",
        }
    }

    /// Structured `{error, message}` payload for this error.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        })
    }
}
