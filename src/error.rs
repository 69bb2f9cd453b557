//! Error types for seedr.
//!
//! Domain errors carry a message string; errors from the HTTP, storage
//! and serialization layers convert via `#[from]`.

use thiserror::Error;

/// Result type alias for seedr operations.
pub type Result<T> = std::result::Result<T, Error>;

/// seedr error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Agent could not be reached: network error, timeout, HTTP >= 400
    /// on a read endpoint, or a malformed payload.
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// Agent refused to start a stage.
    #[error("Agent rejected command: {0}")]
    Rejected(String),

    /// Seed is not feasible for the given pair of agents.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// An agent is already taking part in an active seed.
    #[error("Seed conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Operator-initiated abort.
    #[error("Seed aborted: {0}")]
    Abort(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Topology MySQL failure (replication credentials, CHANGE MASTER).
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("MySQL error: {0}")]
    MySql(#[from] mysql_async::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unreachable(_) => "UNREACHABLE",
            Error::Rejected(_) => "REJECTED",
            Error::CapabilityMismatch(_) => "CAPABILITY_MISMATCH",
            Error::Conflict(_) => "CONFLICT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Abort(_) => "ABORT",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Topology(_) => "TOPOLOGY_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::MySql(_) => "MYSQL_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// True for persistence failures, which abort the current step but
    /// leave the seed to be retried on the next tick.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Database(_))
    }
}
