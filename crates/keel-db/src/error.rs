//! Database error types.

use keel_core::{BuildId, BuildStatus, ConfigVersion};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    /// The subscriber closed its cursor.
    #[error("build event stream closed")]
    StreamClosed,

    /// The build finished and every event has been delivered.
    #[error("end of build event stream")]
    EndOfStream,

    /// The build reached a terminal status and its log accepts no more events.
    #[error("build {0} is completed")]
    BuildCompleted(BuildId),

    #[error("config version conflict: expected {expected}, stored {actual}")]
    ConfigConflict {
        expected: ConfigVersion,
        actual: ConfigVersion,
    },

    #[error("build {build} cannot move from {from} to {to}")]
    InvalidTransition {
        build: BuildId,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("notification bus closed")]
    BusClosed,

    #[error(transparent)]
    Domain(#[from] keel_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Optimistic-concurrency failures are recoverable by re-reading the config.
    pub fn is_config_conflict(&self) -> bool {
        matches!(self, DbError::ConfigConflict { .. })
    }

    /// End-of-stream and closed both mean there is nothing more to read.
    pub fn is_stream_end(&self) -> bool {
        matches!(self, DbError::EndOfStream | DbError::StreamClosed)
    }

    /// Turn a foreign-key violation into `NotFound`, pass anything else through.
    pub(crate) fn missing_reference(err: sqlx::Error, what: impl Into<String>) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                DbError::NotFound(what.into())
            }
            _ => DbError::Database(err),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
