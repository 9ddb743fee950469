//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, OpenRouter, Ollama, vLLM and any endpoint exposing
//! `/chat/completions`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Reasoning side text (`reasoning` or `reasoning_content`)
//! - Recognizing "streaming not permitted" rejections so callers can fall back

use async_trait::async_trait;
use datasage_core::error::ProviderError;
use datasage_core::message::{Message, ToolCallRecord};
use datasage_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Phrases that, next to the word "stream", mark a streaming rejection.
const STREAM_REJECTION_PHRASES: &[&str] = &[
    "not supported",
    "unsupported",
    "not allowed",
    "not permitted",
    "must be verified",
    "does not support",
];

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    extra_body: Option<serde_json::Value>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider. An empty key sends no auth header.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        let api_key = api_key.into();
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: (!api_key.is_empty()).then_some(api_key),
            headers: Vec::new(),
            extra_body: None,
            client,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Build from the `[provider]` config section.
    ///
    /// OpenRouter endpoints get the attribution headers and a latency-sorted
    /// provider preference in every request body.
    pub fn from_config(config: &datasage_config::ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().unwrap_or_default();
        if !config.is_openrouter() {
            return Self::new("openai", &config.base_url, api_key);
        }

        let mut provider = Self::new("openrouter", &config.base_url, api_key)?
            .with_extra_body(serde_json::json!({ "provider": { "sort": "latency" } }));
        if let Some(site) = &config.openrouter.site_url {
            provider = provider.with_header("HTTP-Referer", site);
        }
        if !config.openrouter.app_name.is_empty() {
            provider = provider.with_header("X-Title", &config.openrouter.app_name);
        }
        Ok(provider)
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Merge these top-level fields into every request body.
    pub fn with_extra_body(mut self, extra: serde_json::Value) -> Self {
        self.extra_body = Some(extra);
        self
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(system: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            out.push(ApiMessage::text("system", system));
        }
        for m in messages {
            match m {
                Message::User { content } => out.push(ApiMessage::text("user", content)),
                Message::Assistant {
                    content,
                    tool_calls,
                    ..
                } => out.push(ApiMessage {
                    role: "assistant".into(),
                    content: content.clone(),
                    reasoning: None,
                    reasoning_content: None,
                    tool_calls: (!tool_calls.is_empty()).then(|| {
                        tool_calls
                            .iter()
                            .map(|tc| ApiToolCall {
                                id: tc.id.clone(),
                                r#type: "function".into(),
                                function: ApiFunction {
                                    name: tc.name.clone(),
                                    arguments: tc.arguments.clone(),
                                },
                            })
                            .collect()
                    }),
                    tool_call_id: None,
                }),
                Message::Tool {
                    tool_call_id,
                    output,
                    ..
                } => out.push(ApiMessage {
                    role: "tool".into(),
                    content: Some(output.to_string()),
                    reasoning: None,
                    reasoning_content: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_call_id.clone()),
                }),
            }
        }
        out
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(request.system.as_deref(), &request.messages),
            "temperature": request.temperature,
            "stream": stream,
        });

        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
            body["tool_choice"] = serde_json::json!("auto");
        }

        if let (Some(extra), Some(target)) = (
            self.extra_body.as_ref().and_then(|e| e.as_object()),
            body.as_object_mut(),
        ) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }

        body
    }

    async fn post(&self, body: &serde_json::Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let error_body = response.text().await.unwrap_or_default();
        warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
        Err(classify_error(status, &error_body, retry_after))
    }
}

/// Map an error response to a `ProviderError`.
///
/// Stream rejections are checked first so that a 400/403 refusing `stream: true`
/// becomes `StreamingUnsupported` rather than a hard failure.
pub fn classify_error(status: u16, body: &str, retry_after_secs: Option<u64>) -> ProviderError {
    if (400..500).contains(&status) && is_stream_rejection(body) {
        return ProviderError::StreamingUnsupported(error_message(body));
    }
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(5),
        },
        401 | 403 => ProviderError::AuthenticationFailed(error_message(body)),
        404 if body.to_ascii_lowercase().contains("model") => {
            ProviderError::ModelNotFound(error_message(body))
        }
        _ => ProviderError::ApiError {
            status_code: status,
            message: error_message(body),
        },
    }
}

/// Whether an error body says streaming is refused for this request.
pub fn is_stream_rejection(body: &str) -> bool {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorEnvelope>(body) {
        if parsed.error.param.as_deref() == Some("stream") {
            return true;
        }
    }
    let lower = body.to_ascii_lowercase();
    lower.contains("stream") && STREAM_REJECTION_PHRASES.iter().any(|p| lower.contains(p))
}

/// Extract `error.message` from an OpenAI-style error body, or return the body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorEnvelope>(body)
        .ok()
        .and_then(|e| e.error.message)
        .unwrap_or_else(|| body.trim().to_string())
}

/// Outcome of parsing one SSE `data:` payload.
#[derive(Debug)]
enum SseEvent {
    Delta(StreamDelta),
    Done,
    Failed(ProviderError),
    Ignored,
}

fn parse_sse_data(data: &str) -> SseEvent {
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    // Some providers report failures as an in-stream error object
    if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(data) {
        let message = envelope
            .error
            .message
            .unwrap_or_else(|| "provider error event".into());
        return SseEvent::Failed(if is_stream_rejection(data) {
            ProviderError::StreamingUnsupported(message)
        } else {
            ProviderError::StreamInterrupted(message)
        });
    }

    let chunk = match serde_json::from_str::<StreamResponse>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            return SseEvent::Ignored;
        }
    };

    let mut delta = StreamDelta {
        usage: chunk.usage.map(ApiUsage::into_usage),
        ..Default::default()
    };
    if let Some(choice) = chunk.choices.into_iter().next() {
        let StreamChoiceDelta {
            content,
            reasoning,
            reasoning_content,
            tool_calls,
        } = choice.delta;
        delta.content = content.filter(|c| !c.is_empty());
        delta.reasoning = reasoning.or(reasoning_content).filter(|r| !r.is_empty());
        delta.tool_calls = tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| {
                let (name, arguments) = match tc.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: tc.index,
                    id: tc.id,
                    name,
                    arguments,
                }
            })
            .collect();
        delta.finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);
    }
    SseEvent::Delta(delta)
}

/// Splits a byte stream into lines without breaking multi-byte characters.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

#[async_trait]
impl datasage_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = self.build_body(&request, false);
        debug!(provider = %self.name, model = %request.model, "Sending completion request");

        let response = self.post(&body, false).await?;
        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCallRecord {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect();

        Ok(ProviderResponse {
            content: choice.message.content,
            reasoning: choice.message.reasoning.or(choice.message.reasoning_content),
            tool_calls,
            finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
            usage: api_response.usage.map(ApiUsage::into_usage),
            model: api_response.model.unwrap_or(request.model),
        })
    }

    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }

    async fn stream(&self, request: ProviderRequest) -> std::result::Result<DeltaReceiver, ProviderError> {
        let body = self.build_body(&request, true);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and forward raw deltas
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = LineBuffer::default();

            loop {
                let next = tokio::select! {
                    next = byte_stream.next() => next,
                    () = tx.closed() => {
                        debug!(provider = %provider_name, "Stream receiver dropped, stopping reader");
                        return;
                    }
                };
                let (batch, ended) = match next {
                    Some(Ok(bytes)) => (lines.push(&bytes), false),
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                    None => (lines.finish().into_iter().collect(), true),
                };

                for line in batch {
                    // Skip empty lines, SSE comments and non-data fields
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    match parse_sse_data(data.trim()) {
                        SseEvent::Done => return,
                        SseEvent::Ignored => {}
                        SseEvent::Failed(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        SseEvent::Delta(delta) => {
                            if tx.send(Ok(delta)).await.is_err() {
                                debug!(provider = %provider_name, "Stream receiver dropped, stopping reader");
                                return;
                            }
                        }
                    }
                }

                if ended {
                    break;
                }
            }

            trace!(provider = %provider_name, "Stream ended without [DONE]");
        });

        Ok(rx)
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing)]
    reasoning: Option<String>,
    #[serde(default, skip_serializing)]
    reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ApiMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.into(),
            content: Some(content.into()),
            reasoning: None,
            reasoning_content: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl ApiUsage {
    fn into_usage(self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    param: Option<String>,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamChoiceDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoiceDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call fragment; only the first fragment of a call carries `id` and `name`.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
