//! LLM Provider implementations for Datasage.
//!
//! All providers implement the `datasage_core::Provider` trait.

pub mod openai_compat;

pub use openai_compat::{OpenAiCompatProvider, classify_error, is_stream_rejection};

use datasage_core::error::ProviderError;
use datasage_core::provider::Provider;
use std::sync::Arc;

/// Build the configured provider.
pub fn build_from_config(
    config: &datasage_config::AppConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    if !config.has_api_key() {
        tracing::warn!(
            base_url = %config.provider.base_url,
            "No API key configured (set OPENAI_API_KEY or OPENROUTER_API_KEY)"
        );
    }
    let provider = OpenAiCompatProvider::from_config(&config.provider)?;
    tracing::info!(
        provider = %provider.name(),
        model = %config.provider.model,
        "Provider ready"
    );
    Ok(Arc::new(provider))
}
