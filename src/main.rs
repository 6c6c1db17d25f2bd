//! # authproxy Main Entry Point
//!
//! Runs the OAuth2 connection and token lifecycle service, or applies
//! database migrations and exits.

use anyhow::{Context, Result};
use authproxy::{config::ConfigLoader, db, server::run_server, telemetry};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "authproxy", version, about = "OAuth2 connection and token lifecycle service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply migrations, then serve HTTP and run background tasks
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration from layered env files and variables
    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;

    telemetry::init_tracing(&config).context("initializing telemetry")?;
    tracing::info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let pool = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&pool).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            tracing::info!("Migrations complete");
            Ok(())
        }
        Command::Serve => run_server(config, pool).await,
    }
}
