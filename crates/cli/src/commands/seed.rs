//! `datasage seed`: Create and fill the demo dataset.

use datasage_config::AppConfig;
use datasage_database::{Database, SeedOptions};

pub async fn run(options: SeedOptions) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    std::fs::create_dir_all(&config.workspace.dir)?;
    tracing::info!(reset = options.reset, "Seeding dataset");

    let db = Database::connect(&config.database_url()).await?;
    let report = datasage_database::seed(&db, &options).await?;

    println!("Seeded {}", db.location());
    println!("   customers:   {}", report.customers);
    println!("   products:    {}", report.products);
    println!("   orders:      {}", report.orders);
    println!("   order_items: {}", report.order_items);
    println!();
    println!("{}", serde_json::to_string_pretty(&db.schema().await?)?);

    db.close().await?;
    Ok(())
}
