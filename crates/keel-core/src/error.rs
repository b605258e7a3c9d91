//! Error types for Keel domain validation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown build status: {0}")]
    UnknownStatus(String),

    #[error("unknown event type: {0}")]
    UnknownEvent(String),
}

pub type Result<T> = std::result::Result<T, Error>;
