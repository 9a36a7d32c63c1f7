//! Error types for raider_sync

use thiserror::Error;

/// Unified error type for sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// HTTP request failed (network error, timeout, etc.)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP error status code
    #[error("HTTP error: {0}")]
    HttpStatus(reqwest::StatusCode),

    /// Failed to parse a JSON payload
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A timestamp from a data source could not be parsed
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),

    /// The on-disk schema version is unreachable from the known migrations
    #[error("expected DB schema version {expected} but found {found}")]
    SchemaVersion { found: i64, expected: i64 },

    /// A gear dump file was written by an unsupported code version
    #[error("unsupported gear dump version {0}")]
    DumpVersion(i64),

    /// A gear dump row's stored hash does not match its contents
    #[error("gear dump hash mismatch for item {0:?}")]
    DumpCorrupt(String),

    /// The job was interrupted by shutdown
    #[error("shutting down")]
    Cancelled,
}

/// Result alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
