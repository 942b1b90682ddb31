//! mongokit CLI - connection checks and test database resets for CI scripts
//!
//! Usage:
//!   mongokit ping                       Open the connection and ping the server
//!   mongokit list                       List user collections
//!   mongokit --test clear-collections   Delete every document in the test database
//!   mongokit --test clear-indexes       Drop every secondary index in the test database
//!
//! The connection string comes from `MONGO_CONNECTION_STRING`, or
//! `MONGO_TEST_CONNECTION_STRING` with `--test`. `--options` takes a JSON
//! object such as `{"keepAlive": 500, "reconnectTries": 3}`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use mongokit_mongodb::{
    list_resettable_resources, ConnectOverrides, DatabaseConfig, Environment, MongoConnector,
};
use mongokit_test::{DatabaseFixture, ProcessExit};

#[derive(Parser)]
#[command(name = "mongokit")]
#[command(about = "MongoDB connection and test database utilities", long_about = None)]
#[command(version)]
struct Cli {
    /// Use MONGO_TEST_CONNECTION_STRING instead of MONGO_CONNECTION_STRING
    #[arg(long, global = true)]
    test: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Connection overrides as a JSON object
    #[arg(long, global = true, value_name = "JSON")]
    options: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the connection and ping the server
    Ping,
    /// List the collections a reset would touch
    List,
    /// Delete every document in every user collection
    ClearCollections,
    /// Drop every secondary index in every user collection
    ClearIndexes,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = load_config(&cli)?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(run(cli.command, config))
}

fn load_config(cli: &Cli) -> Result<DatabaseConfig> {
    let environment = if cli.test {
        Environment::Test
    } else {
        Environment::Default
    };
    let mut config = DatabaseConfig::from_env(environment)?;
    if let Some(json) = &cli.options {
        config.overrides = ConnectOverrides::from_json(json)?.or(config.overrides);
    }
    Ok(config)
}

async fn run(command: Commands, config: DatabaseConfig) -> Result<()> {
    let fixture = DatabaseFixture::from_config(MongoConnector, &config, Arc::new(ProcessExit))?;

    let outcome = execute(&fixture, command).await;
    fixture.shutdown().await;
    outcome
}

async fn execute(fixture: &DatabaseFixture<MongoConnector>, command: Commands) -> Result<()> {
    match command {
        Commands::Ping => {
            let connection = fixture.connection().await?;
            connection.ping().await?;
            println!("ok {}", connection.database_name());
        }
        Commands::List => {
            let connection = fixture.connection().await?;
            let resources = list_resettable_resources(connection.as_ref()).await?;
            for resource in resources {
                println!("{}", resource.name);
            }
        }
        Commands::ClearCollections => {
            let report = fixture
                .clear_collections()
                .await
                .context("Failed to clear collections")?;
            info!(collections = report.collections.len(), "collections cleared");
            println!(
                "cleared {} documents from {} collections",
                report.documents_deleted,
                report.collections.len()
            );
        }
        Commands::ClearIndexes => {
            let report = fixture
                .clear_indexes()
                .await
                .context("Failed to clear indexes")?;
            println!("dropped indexes on {} collections", report.collections.len());
        }
    }
    Ok(())
}

/// Initialize logging based on log level
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok(); // Ignore error if already initialized

    Ok(())
}
