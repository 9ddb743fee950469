//! `datasage schema`: Print the dataset schema as JSON.

use datasage_config::AppConfig;
use datasage_database::Database;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let db = Database::connect(&config.database_url()).await?;
    println!("{}", serde_json::to_string_pretty(&db.schema().await?)?);
    db.close().await?;
    Ok(())
}
