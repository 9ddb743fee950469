//! `datasage serve`: Start the HTTP API server.

use datasage_config::AppConfig;

pub async fn run(port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Datasage gateway");
    println!("   Listening: http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Model:     {}", config.provider.model);
    println!("   Workspace: {}", config.workspace.dir.display());
    if !config.has_api_key() {
        println!("   Warning:   no API key set (OPENAI_API_KEY or OPENROUTER_API_KEY)");
    }

    datasage_gateway::start(config).await?;

    Ok(())
}
