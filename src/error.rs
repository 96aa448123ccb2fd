//! Error types for the file store

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the file store
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Allocation would push the ledger past its ceiling
    #[error("Quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },

    /// Unknown object or connection
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object id is already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation on a closed handle, reader, writer or connection.
    /// Stale readers (version advanced) report this as well.
    #[error("Closed: {0}")]
    Closed(&'static str),

    /// Caller aborted a transfer midway
    #[error("Transfer cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Several independent failures collected by a best-effort pass
    #[error("{} errors, first: {}", .0.len(), first_message(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Outbound HTTP call to an origin host failed
    #[error("Origin request failed: {0}")]
    Origin(#[source] reqwest::Error),

    /// Origin host answered with an unexpected status
    #[error("Origin {host} answered with status {status}")]
    OriginStatus { host: String, status: u16 },

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed request from a direct caller
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn first_message(errors: &[Error]) -> String {
    errors.first().map(|e| e.to_string()).unwrap_or_default()
}

impl Error {
    /// Build an aggregate, collapsing the trivial cases.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}
