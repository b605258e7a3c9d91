//! CLI command implementations.

pub mod builds;
pub mod pipelines;

use anyhow::{Context, Result};
use keel_db::{BusConfig, Database, create_pool, run_migrations};
use std::time::Duration;
use tracing::info;

pub async fn connect(database_url: &str, poll_interval_secs: u64) -> Result<Database> {
    let config = BusConfig {
        poll_interval: Duration::from_secs(poll_interval_secs),
        ..BusConfig::default()
    };

    info!("Connecting to database...");
    let db = Database::connect(database_url, config)
        .await
        .context("Failed to connect to database")?;
    info!("Database connected");
    Ok(db)
}

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = create_pool(database_url)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool).await.context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}
