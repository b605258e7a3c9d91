//! Persistence layer for Keel.
//!
//! Build event log with live cursors, the notification bus they wake on,
//! build lifecycle transitions, versioned pipeline configs and the
//! resource ledger, all on PostgreSQL.

pub mod bus;
pub mod error;
pub mod events;
pub mod repo;

pub use bus::{BusConfig, Listener, NotificationBus};
pub use error::{DbError, DbResult};
pub use events::{BuildEvent, BuildEvents, EventLog, PgEventLog, build_events_topic};
pub use repo::*;

use keel_core::{BuildId, SavedPipeline, TeamId};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Entry point handing out scoped repository handles.
///
/// Every handle shares the pool and one notification bus, so a process
/// holds a single LISTEN connection however many cursors are open.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    bus: NotificationBus,
}

impl Database {
    /// Connect to `database_url` and start the notification bus.
    pub async fn connect(database_url: &str, config: BusConfig) -> DbResult<Self> {
        let pool = create_pool(database_url).await?;
        Self::from_pool(pool, config).await
    }

    pub async fn from_pool(pool: PgPool, config: BusConfig) -> DbResult<Self> {
        let bus = NotificationBus::connect(&pool, config).await?;
        Ok(Self { pool, bus })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    pub fn team(&self, name: impl Into<String>) -> TeamDb {
        TeamDb::new(name, self.pool.clone(), self.bus.clone())
    }

    pub fn pipeline(&self, pipeline: SavedPipeline) -> PipelineDb {
        PipelineDb::new(pipeline, self.pool.clone(), self.bus.clone())
    }

    pub fn build(&self, id: BuildId) -> BuildDb {
        BuildDb::new(id, self.pool.clone(), self.bus.clone())
    }

    pub fn ledger(&self) -> PgResourceLedger {
        PgResourceLedger::new(self.pool.clone())
    }

    /// Stop the notification bus, then close the pool.
    ///
    /// Open cursors fall back to polling and fail once the pool is gone.
    pub async fn close(&self) {
        self.bus.close().await;
        self.pool.close().await;
        info!("Database closed");
    }

    /// Create a team, or return the id of the existing one.
    pub async fn create_team(&self, name: &str) -> DbResult<TeamId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO teams (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        info!(team = name, team_id = id, "Ensured team exists");
        Ok(TeamId::new(id))
    }
}
