//! Engine error types.

use bottlesync_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Catalog retrieval failed. Fatal for the run.
#[derive(Debug, Error)]
pub enum CatalogFetchError {
    #[error("catalog request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("catalog at {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("catalog response is not usable: {0}")]
    Decode(String),
}

/// Publishing the ledger failed. Fatal for the run.
#[derive(Debug, Error)]
pub enum LedgerCommitError {
    #[error("ledger commit lost {attempts} consecutive races with other writers")]
    Conflict { attempts: u32 },

    #[error("ledger storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ledger serialization failed: {0}")]
    Serialize(#[from] bottlesync_core::Error),
}

/// The supplementary ledger could not be loaded. Always recovered.
#[derive(Debug, Error)]
pub enum ExternalSourceError {
    #[error("external hash source must use https: {0}")]
    InsecureUrl(String),

    #[error("external hash source request failed: {0}")]
    Request(String),

    #[error("external hash source returned HTTP {0}")]
    Status(u16),

    #[error("external hash source is larger than {limit} bytes (at least {size})")]
    TooLarge { size: u64, limit: u64 },

    #[error("external hash source storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("external hash source document rejected: {0}")]
    Document(#[from] bottlesync_core::Error),
}

/// A single artifact fetch attempt failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} fetching artifact")]
    Status { status: u16 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Transport failures, timeouts, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            Self::Transport(_) | Self::Timeout(_) => true,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Notification delivery failed. Logged and otherwise ignored.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook returned HTTP {0}")]
    Status(u16),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that stop a sync engine from being built or a run from starting.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Catalog(#[from] CatalogFetchError),

    #[error(transparent)]
    LedgerCommit(#[from] LedgerCommitError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
