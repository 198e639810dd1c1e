//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid bottle key: {0}")]
    InvalidBottleKey(String),

    #[error("ledger document is corrupt: {0}")]
    CorruptLedger(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
