//! HTTP API gateway for Datasage.
//!
//! Exposes the NDJSON chat stream, session management, tool discovery,
//! recent traces and a health check. Built on Axum.

pub mod api;

use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use axum::Router;
use datasage_agent::{AgentLoop, ToolDispatcher};
use datasage_config::AppConfig;
use datasage_core::error::{ProviderError, SessionError, ToolError};
use datasage_core::tool::ToolRegistry;
use datasage_database::{Database, DatabaseError};
use datasage_sessions::SessionStore;
use datasage_telemetry::TelemetryEngine;
use datasage_tools::Workspace;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Shared application state.
pub struct AppState {
    pub agent: Arc<AgentLoop>,
    pub store: Arc<SessionStore>,
    pub tools: Arc<ToolRegistry>,
    pub telemetry: Arc<TelemetryEngine>,
}

pub type SharedState = Arc<AppState>;

/// Failures while assembling the server.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Workspace unavailable: {0}")]
    Workspace(#[from] ToolError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Sessions(#[from] SessionError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Server I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the router with every route.
///
/// Layers: 1 MB body limit, permissive CORS for local UIs, HTTP trace logging.
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    api::routes()
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Assemble provider, dataset, session store, tools, telemetry and agent
/// from configuration. Each is built once and shared.
pub async fn build_state(config: &AppConfig) -> Result<SharedState, StartupError> {
    let workspace = Workspace::new(&config.workspace.dir)?;
    info!(workspace = %workspace.root().display(), "Workspace ready");

    let database = Arc::new(Database::connect(&config.database_url()).await?);
    let store = Arc::new(SessionStore::open(config.sessions_path()).await?);
    let provider = datasage_providers::build_from_config(config)?;

    let tools = Arc::new(datasage_tools::default_registry(workspace, database));
    let dispatcher = Arc::new(ToolDispatcher::new(tools.clone()));

    let telemetry = Arc::new(TelemetryEngine::new());
    let sink = datasage_telemetry::build_sink(&config.tracing, telemetry.clone());

    let agent = Arc::new(
        AgentLoop::new(provider, store.clone(), dispatcher, &config.provider.model)
            .with_temperature(config.provider.temperature)
            .with_max_tokens(config.provider.max_tokens)
            .with_system_prompt(config.agent.system_prompt.as_deref())
            .with_max_iterations(config.agent.max_iterations)
            .with_fallback_chunk_size(config.agent.fallback_chunk_size)
            .with_tracer(Arc::new(sink)),
    );

    Ok(Arc::new(AppState {
        agent,
        store,
        tools,
        telemetry,
    }))
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), StartupError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = build_state(&config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, model = %config.provider.model, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
