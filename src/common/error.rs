//! Error types for multiupdate

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Document Store Errors ===
    #[error("Coordinator document not found: {0}")]
    NotFound(String),

    #[error("Coordinator document already exists: {0}")]
    DuplicateDocument(String),

    #[error("Write concern not satisfied: {0}")]
    WriteConcern(String),

    #[error("Not primary: {0}")]
    NotPrimary(String),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Document corrupted: {0}")]
    Corrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // === Coordination Errors ===
    #[error("Conflicting multi-update in progress on {namespace}: {existing}")]
    ConflictingOperationInProgress { namespace: String, existing: String },

    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("Multi-update still in progress: {0}")]
    OperationInProgress(String),

    #[error("Migration blocking failed: {0}")]
    MigrationBlocking(String),

    #[error("Update failed on {shard}: {reason}")]
    UpdateFailed { shard: String, reason: String },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteConcern(_) | Error::NotPrimary(_) | Error::Timeout(_)
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ConflictingOperationInProgress { .. }
            | Error::OperationInProgress(_)
            | Error::DuplicateDocument(_) => StatusCode::CONFLICT,
            Error::InvalidNamespace(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::NotPrimary(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::WriteConcern(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

/// Final failure of a multi-update operation.
///
/// Persisted in the coordinator document and published through the
/// completion future, so it must stay cloneable and serializable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum OperationFailure {
    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("coordinator stepped down before completion")]
    SteppedDown,

    #[error("coordinator failed: {0}")]
    Fatal(String),
}

impl OperationFailure {
    /// Cancellation outcomes are reported separately from real failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, OperationFailure::Aborted(_) | OperationFailure::SteppedDown)
    }
}
