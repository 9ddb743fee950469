//! Configuration loading, validation, and management for Datasage.
//!
//! Loads configuration from `./datasage.toml` (or the file named by
//! `DATASAGE_CONFIG`), then applies `.env` and environment variable
//! overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "DATASAGE_CONFIG";

/// The root configuration structure.
///
/// Maps directly to `datasage.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model provider settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Workspace sandbox for file tools
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Dataset the SQL tools run against
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Session store location
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Lifecycle tracing export
    #[serde(default)]
    pub tracing: TracingConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-5-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_iterations() -> usize {
    25
}
fn default_chunk_size() -> usize {
    48
}
fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspace")
}
fn default_langfuse_host() -> String {
    "https://cloud.langfuse.com".into()
}
fn default_app_name() -> String {
    "Datasage".into()
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Attribution headers, only sent to openrouter.ai
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            openrouter: OpenRouterConfig::default(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("openrouter", &self.openrouter)
            .finish()
    }
}

impl ProviderConfig {
    /// Whether the configured endpoint is OpenRouter.
    pub fn is_openrouter(&self) -> bool {
        self.base_url.contains("openrouter.ai")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Sent as `HTTP-Referer`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,

    /// Sent as `X-Title`
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            site_url: None,
            app_name: default_app_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on model rounds per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Piece size (in chars) for chunks synthesized by the non-streaming fallback
    #[serde(default = "default_chunk_size")]
    pub fallback_chunk_size: usize,

    /// Replaces the built-in data-analyst instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            fallback_chunk_size: default_chunk_size(),
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_dir")]
    pub dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            dir: default_workspace_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite://...` URL; defaults to `agent.db` inside the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Defaults to `sessions.json` inside the workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langfuse_public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub langfuse_secret_key: Option<String>,

    #[serde(default = "default_langfuse_host")]
    pub langfuse_host: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            langfuse_public_key: None,
            langfuse_secret_key: None,
            langfuse_host: default_langfuse_host(),
        }
    }
}

impl std::fmt::Debug for TracingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingConfig")
            .field("enabled", &self.enabled)
            .field("langfuse_public_key", &self.langfuse_public_key)
            .field("langfuse_secret_key", &redact(&self.langfuse_secret_key))
            .field("langfuse_host", &self.langfuse_host)
            .finish()
    }
}

impl TracingConfig {
    /// Langfuse export is on only when tracing is enabled and both keys are set.
    pub fn langfuse_enabled(&self) -> bool {
        self.enabled && self.langfuse_public_key.is_some() && self.langfuse_secret_key.is_some()
    }
}

impl AppConfig {
    /// Load configuration the way the binary does.
    ///
    /// Reads `.env` (never overriding variables already set), then the TOML
    /// file named by `DATASAGE_CONFIG` or `./datasage.toml`, then applies
    /// environment overrides:
    /// - `OPENAI_API_KEY`, falling back to `OPENROUTER_API_KEY`
    /// - `OPENAI_BASE_URL`, `OPENAI_MODEL`
    /// - `APP_HOST`, `APP_PORT`
    /// - `WORKSPACE_DIR`, `DATABASE_URL`, `SESSIONS_PATH`
    /// - `LANGFUSE_PUBLIC_KEY`, `LANGFUSE_SECRET_KEY`, `LANGFUSE_HOST` (or `LANGFUSE_BASE_URL`)
    /// - `TRACING_ENABLED` (`"0"` disables)
    /// - `OPENROUTER_SITE_URL`, `OPENROUTER_APP_NAME`
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }

        let config_path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("datasage.toml"));
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(key) = var("OPENAI_API_KEY").or_else(|| var("OPENROUTER_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = var("OPENAI_MODEL") {
            self.provider.model = model;
        }
        if let Some(host) = var("APP_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = var("APP_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("APP_PORT is not a valid port: {port}"))
            })?;
        }
        if let Some(dir) = var("WORKSPACE_DIR") {
            self.workspace.dir = PathBuf::from(dir);
        }
        if let Some(url) = var("DATABASE_URL") {
            self.database.url = Some(url);
        }
        if let Some(path) = var("SESSIONS_PATH") {
            self.sessions.path = Some(PathBuf::from(path));
        }
        if let Some(key) = var("LANGFUSE_PUBLIC_KEY") {
            self.tracing.langfuse_public_key = Some(key);
        }
        if let Some(key) = var("LANGFUSE_SECRET_KEY") {
            self.tracing.langfuse_secret_key = Some(key);
        }
        if let Some(host) = var("LANGFUSE_HOST").or_else(|| var("LANGFUSE_BASE_URL")) {
            self.tracing.langfuse_host = host;
        }
        if let Some(flag) = var("TRACING_ENABLED") {
            self.tracing.enabled = flag != "0";
        }
        if let Some(site) = var("OPENROUTER_SITE_URL") {
            self.provider.openrouter.site_url = Some(site);
        }
        if let Some(name) = var("OPENROUTER_APP_NAME") {
            self.provider.openrouter.app_name = name;
        }
        Ok(())
    }

    /// URL of the dataset, defaulting to `agent.db` in the workspace.
    pub fn database_url(&self) -> String {
        match &self.database.url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}", self.workspace.dir.join("agent.db").display()),
        }
    }

    /// Path of the session file, defaulting to `sessions.json` in the workspace.
    pub fn sessions_path(&self) -> PathBuf {
        self.sessions
            .path
            .clone()
            .unwrap_or_else(|| self.workspace.dir.join("sessions.json"))
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.temperature < 0.0 || self.provider.temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.fallback_chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "agent.fallback_chunk_size must be at least 1".into(),
            ));
        }

        if self.provider.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("provider.model must not be empty".into()));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
