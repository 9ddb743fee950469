//! Datasage CLI: the main entry point.
//!
//! Commands:
//! - `serve`  : Start the HTTP API server
//! - `seed`   : Create and fill the demo dataset
//! - `schema` : Print the dataset schema as JSON

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "datasage",
    about = "Datasage: a data-analyst agent over SQLite",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create the demo tables and fill the empty ones
    Seed {
        /// Delete existing rows first
        #[arg(long)]
        reset: bool,

        #[arg(long, default_value_t = 50)]
        customers: usize,

        #[arg(long, default_value_t = 40)]
        products: usize,

        #[arg(long, default_value_t = 300)]
        orders: usize,
    },

    /// Print the dataset schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Seed {
            reset,
            customers,
            products,
            orders,
        } => {
            let options = datasage_database::SeedOptions {
                reset,
                customers,
                products,
                orders,
            };
            commands::seed::run(options).await?
        }
        Commands::Schema => commands::schema::run().await?,
    }

    Ok(())
}
