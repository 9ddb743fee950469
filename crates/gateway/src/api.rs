//! HTTP API handlers.
//!
//! Endpoints:
//!
//! - `GET    /health`             : Liveness and version
//! - `POST   /api/new_chat`       : Create a session
//! - `POST   /api/chat`           : Send a message, get an NDJSON event stream
//! - `GET    /api/sessions`       : List sessions, newest first
//! - `GET    /api/sessions/{id}`  : Full session with messages
//! - `PATCH  /api/sessions/{id}`  : Rename or change model
//! - `DELETE /api/sessions/{id}`  : Delete a session
//! - `GET    /api/tools`          : Tool descriptors
//! - `GET    /api/traces`         : Recent in-memory traces
//! - `GET    /api/traces/{id}`    : One trace

use crate::SharedState;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use datasage_core::message::{Session, SessionMeta};
use datasage_core::tool::ToolDescriptor;
use datasage_sessions::new_session_id;
use datasage_telemetry::{Trace, UsageSnapshot};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Characters of the first message used as an automatic title.
const AUTO_TITLE_CHARS: usize = 60;

/// Traces returned when no limit is given.
const DEFAULT_TRACE_LIMIT: usize = 50;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/new_chat", post(new_chat_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route(
            "/api/sessions/{id}",
            get(get_session_handler)
                .patch(update_session_handler)
                .delete(delete_session_handler),
        )
        .route("/api/tools", get(list_tools_handler))
        .route("/api/traces", get(list_traces_handler))
        .route("/api/traces/{id}", get(get_trace_handler))
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Default, Deserialize)]
struct NewChatRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct NewChatResponse {
    chat_id: String,
}

#[derive(Default, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SessionListResponse {
    sessions: Vec<SessionMeta>,
}

#[derive(Serialize, Deserialize)]
struct SessionDetailResponse {
    id: String,
    #[serde(flatten)]
    session: Session,
}

#[derive(Default, Deserialize)]
struct UpdateSessionRequest {
    #[serde(default)]
    title: Option<String>,
    /// An empty string clears the selection back to the default model.
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ToolListResponse {
    tools: Vec<ToolDescriptor>,
}

#[derive(Deserialize)]
struct TraceQuery {
    limit: Option<usize>,
    session_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct TraceListResponse {
    traces: Vec<Trace>,
    usage: UsageSnapshot,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Parse an optional JSON body; an empty body is the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn auto_title(message: &str) -> String {
    message.trim().chars().take(AUTO_TITLE_CHARS).collect()
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

async fn new_chat_handler(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<NewChatResponse>, ApiError> {
    let request: NewChatRequest = parse_body(&body)?;
    let chat_id = new_session_id();
    let title = non_empty(request.title).unwrap_or_default();
    state
        .store
        .create(&chat_id, &title, Utc::now(), non_empty(request.model))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to create session");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    info!(chat_id = %chat_id, "Session created");
    Ok(Json(NewChatResponse { chat_id }))
}

/// Append the user message and stream the turn as NDJSON.
///
/// Dropping the response body (client disconnect) cancels the turn.
async fn chat_handler(State(state): State<SharedState>, body: Bytes) -> Result<Response, ApiError> {
    let request: ChatRequest = parse_body(&body)?;
    let (Some(chat_id), Some(message)) = (non_empty(request.chat_id), non_empty(request.message))
    else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Both chat_id and message are required",
        ));
    };

    let now = Utc::now();
    let persisted = match state.store.get(&chat_id).await {
        None => state
            .store
            .create(&chat_id, &auto_title(&message), now, None)
            .await
            .map(|_| ()),
        Some(session) if session.title.trim().is_empty() => state
            .store
            .rename(&chat_id, &auto_title(&message), now)
            .await
            .map(|_| ()),
        Some(_) => Ok(()),
    };
    persisted.map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let cancel = CancellationToken::new();
    let rx = state
        .agent
        .chat(&chat_id, &message, cancel.clone())
        .await
        .map_err(|e| {
            error!(chat_id = %chat_id, error = %e, "Failed to persist user message");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;
    info!(chat_id = %chat_id, message_len = message.len(), "Chat turn started");

    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |event| {
        let _held = &guard;
        Ok::<_, Infallible>(Bytes::from(event.to_ndjson_line()))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn list_sessions_handler(State(state): State<SharedState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.store.list().await,
    })
}

async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let session = state
        .store
        .get(&id)
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Session not found: {id}")))?;
    Ok(Json(SessionDetailResponse { id, session }))
}

async fn update_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let request: UpdateSessionRequest = parse_body(&body)?;
    let now = Utc::now();
    let internal = |e: datasage_core::error::SessionError| {
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    };

    let mut found = state.store.get(&id).await.is_some();
    if let Some(title) = request.title {
        found = state.store.rename(&id, title.trim(), now).await.map_err(internal)?;
    }
    if let Some(model) = request.model {
        found = state
            .store
            .update_model(&id, non_empty(Some(model)), now)
            .await
            .map_err(internal)?;
    }
    if !found {
        return Err(api_error(StatusCode::NOT_FOUND, format!("Session not found: {id}")));
    }
    get_session_handler(State(state), Path(id)).await
}

async fn delete_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.store.delete(&id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("Session not found: {id}"))),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.descriptors(),
    })
}

async fn list_traces_handler(
    State(state): State<SharedState>,
    Query(query): Query<TraceQuery>,
) -> Json<TraceListResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_TRACE_LIMIT);
    let traces = match query.session_id {
        Some(session_id) => {
            let mut traces = state.telemetry.traces_for_session(&session_id);
            traces.truncate(limit);
            traces
        }
        None => state.telemetry.recent_traces(limit),
    };
    Json(TraceListResponse {
        traces,
        usage: state.telemetry.usage_snapshot(),
    })
}

async fn get_trace_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Trace>, ApiError> {
    state
        .telemetry
        .get_trace(&id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Trace not found: {id}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AppState, build_router};
    use async_trait::async_trait;
    use axum::http::Request;
    use datasage_agent::{AgentLoop, ToolDispatcher};
    use datasage_core::error::ProviderError;
    use datasage_core::message::Message;
    use datasage_core::provider::{
        DeltaReceiver, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamDelta,
    };
    use datasage_database::Database;
    use datasage_sessions::SessionStore;
    use datasage_telemetry::{TelemetryEngine, TraceSink};
    use datasage_tools::Workspace;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Streams a fixed answer in two pieces.
    struct AnswerProvider;

    #[async_trait]
    impl Provider for AnswerProvider {
        fn name(&self) -> &str {
            "answer"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::InvalidResponse("streaming only".into()))
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<DeltaReceiver, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            for delta in [
                StreamDelta {
                    content: Some("Hello".into()),
                    ..Default::default()
                },
                StreamDelta {
                    content: Some(" world".into()),
                    finish_reason: Some(FinishReason::Stop),
                    ..Default::default()
                },
            ] {
                let _ = tx.send(Ok(delta)).await;
            }
            Ok(rx)
        }
    }

    /// Sends one piece of text, then holds the stream open until the
    /// consumer goes away.
    struct StallingProvider {
        closed: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Provider for StallingProvider {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::InvalidResponse("streaming only".into()))
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<DeltaReceiver, ProviderError> {
            let (tx, rx) = mpsc::channel(4);
            let _ = tx
                .send(Ok(StreamDelta {
                    content: Some("Partial".into()),
                    ..Default::default()
                }))
                .await;
            let closed = self.closed.clone();
            tokio::spawn(async move {
                tx.closed().await;
                closed.notify_one();
            });
            Ok(rx)
        }
    }

    struct TestApp {
        state: SharedState,
        _dir: tempfile::TempDir,
    }

    impl TestApp {
        async fn new() -> Self {
            Self::with_provider(Arc::new(AnswerProvider)).await
        }

        async fn with_provider(provider: Arc<dyn Provider>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let workspace = Workspace::new(dir.path().join("workspace")).unwrap();
            let database = Arc::new(Database::in_memory().await.unwrap());
            let store = Arc::new(SessionStore::open(dir.path().join("sessions.json")).await.unwrap());
            let tools = Arc::new(datasage_tools::default_registry(workspace, database));
            let telemetry = Arc::new(TelemetryEngine::new());
            let tracer: Arc<dyn TraceSink> = telemetry.clone();
            let agent = Arc::new(
                AgentLoop::new(
                    provider,
                    store.clone(),
                    Arc::new(ToolDispatcher::new(tools.clone())),
                    "gpt-5-mini",
                )
                .with_tracer(tracer),
            );
            let state = Arc::new(AppState {
                agent,
                store,
                tools,
                telemetry,
            });
            Self { state, _dir: dir }
        }

        async fn send(&self, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, Bytes) {
            let body = match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            };
            let req = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap();
            let response = build_router(self.state.clone()).oneshot(req).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, bytes)
        }

        async fn new_chat(&self) -> String {
            let (status, body) = self.send("POST", "/api/new_chat", None).await;
            assert_eq!(status, StatusCode::OK);
            let created: NewChatResponse = serde_json::from_slice(&body).unwrap();
            created.chat_id
        }
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = TestApp::new().await;
        let (status, body) = app.send("GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn new_chat_creates_listed_session() {
        let app = TestApp::new().await;
        let id = app.new_chat().await;
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let (_, body) = app.send("GET", "/api/sessions", None).await;
        let list: SessionListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.sessions.len(), 1);
        assert_eq!(list.sessions[0].id, id);
    }

    #[tokio::test]
    async fn chat_requires_both_fields() {
        let app = TestApp::new().await;
        for body in [
            serde_json::json!({"message": "hi"}),
            serde_json::json!({"chat_id": "abc"}),
            serde_json::json!({"chat_id": "abc", "message": "   "}),
        ] {
            let (status, bytes) = app.send("POST", "/api/chat", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let err: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
            assert!(err.error.contains("required"));
        }
        assert!(app.state.store.list().await.is_empty());
    }

    #[tokio::test]
    async fn chat_streams_ndjson_and_persists() {
        let app = TestApp::new().await;
        let id = app.new_chat().await;
        let message = "Which city has the most customers and how much did they spend last year?";
        let (status, body) = app
            .send("POST", "/api/chat", Some(serde_json::json!({"chat_id": id, "message": message})))
            .await;
        assert_eq!(status, StatusCode::OK);

        let lines: Vec<serde_json::Value> = String::from_utf8(body.to_vec())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                serde_json::json!({"chunk": "Hello"}),
                serde_json::json!({"chunk": " world"}),
                serde_json::json!({"done": true}),
            ]
        );

        let session = app.state.store.get(&id).await.unwrap();
        assert_eq!(session.title.chars().count(), AUTO_TITLE_CHARS);
        assert!(message.starts_with(&session.title));
        assert_eq!(session.messages.len(), 2);
        assert!(matches!(&session.messages[1], Message::Assistant { content: Some(c), .. } if c == "Hello world"));

        let (_, body) = app.send("GET", &format!("/api/traces?session_id={id}"), None).await;
        let traces: TraceListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(traces.traces.len(), 1);
        assert_eq!(traces.usage.turns, 1);
    }

    #[tokio::test]
    async fn dropping_chat_body_cancels_the_turn() {
        let closed = Arc::new(tokio::sync::Notify::new());
        let app = TestApp::with_provider(Arc::new(StallingProvider {
            closed: closed.clone(),
        }))
        .await;
        let chat_id = app.new_chat().await;

        let req = Request::builder()
            .method("POST")
            .uri("/api/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"chat_id": chat_id, "message": "Count the orders"}).to_string(),
            ))
            .unwrap();
        let response = build_router(app.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let line = frame.into_data().unwrap();
        assert_eq!(&line[..], b"{\"chunk\":\"Partial\"}\n");
        drop(body);

        tokio::time::timeout(std::time::Duration::from_secs(2), closed.notified())
            .await
            .expect("provider stream should be released after the client goes away");
        let messages = app.state.store.get_messages(&chat_id).await;
        assert_eq!(messages, vec![Message::user("Count the orders")]);
    }

    #[tokio::test]
    async fn chat_creates_unknown_session() {
        let app = TestApp::new().await;
        let (status, _) = app
            .send("POST", "/api/chat", Some(serde_json::json!({"chat_id": "fresh", "message": "Hi"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.state.store.get("fresh").await.unwrap().title, "Hi");
    }

    #[tokio::test]
    async fn session_crud() {
        let app = TestApp::new().await;
        let (status, _) = app.send("GET", "/api/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = app.new_chat().await;
        let (status, body) = app
            .send(
                "PATCH",
                &format!("/api/sessions/{id}"),
                Some(serde_json::json!({"title": "Revenue", "model": "openai/gpt-4o"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let detail: SessionDetailResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(detail.id, id);
        assert_eq!(detail.session.title, "Revenue");
        assert_eq!(detail.session.model.as_deref(), Some("openai/gpt-4o"));

        let (status, _) = app
            .send("PATCH", "/api/sessions/nope", Some(serde_json::json!({"title": "x"})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.send("DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = app.send("DELETE", &format!("/api/sessions/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_tools() {
        let app = TestApp::new().await;
        let (status, body) = app.send("GET", "/api/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let names: Vec<&str> = json["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["list_files", "read_file", "search_files", "sql_query", "sql_schema", "write_file"]
        );
        assert!(json["tools"][0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn unknown_trace_is_404() {
        let app = TestApp::new().await;
        let (status, _) = app.send("GET", "/api/traces/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
