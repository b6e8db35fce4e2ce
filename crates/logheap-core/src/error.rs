//! Error types for Logheap core operations.
//!
//! Library code returns [`LogheapError`]; binaries wrap it in `anyhow` for
//! reporting. Some variants are expected during normal operation (a scan
//! window that holds no message start) and callers branch on them with the
//! predicates below instead of treating them as failures.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using LogheapError
pub type Result<T> = std::result::Result<T, LogheapError>;

/// Core error types for Logheap operations.
#[derive(Error, Debug)]
pub enum LogheapError {
    // === Scanning Errors ===
    /// The scanned byte range holds no message start
    #[error("no message start found in the scanned range")]
    NoMessageStartFound,

    /// A date substring did not match the configured format
    #[error("cannot parse date {value:?} with format {format:?}")]
    DateParse { value: String, format: String },

    // === Ingestion Errors ===
    /// A file expected by the catalog is gone or unreadable
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    // === Query Errors ===
    /// The query text does not follow the query grammar
    #[error("query syntax error at {position}: {reason}")]
    QuerySyntax { position: usize, reason: String },

    /// Invalid search pattern (e.g., bad regex)
    #[error("invalid search pattern: {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Query record does not exist
    #[error("query {id} not found")]
    QueryNotFound { id: u64 },

    // === Storage Errors ===
    /// A snapshot exists but cannot be decoded
    #[error("storage is corrupted: {reason}")]
    StorageCorrupted { reason: String },

    /// The snapshot format version is newer than this build understands
    #[error("storage version mismatch: found {found}, expected {expected}")]
    StorageVersionMismatch { found: u32, expected: u32 },

    /// Segment row does not exist
    #[error("segment {id} not found")]
    SegmentNotFound { id: u64 },

    /// A writer actor has shut down and no longer accepts rows
    #[error("writer {name} is closed")]
    WriterClosed { name: String },

    /// A writer actor's sink rejected a batch
    #[error("writer {name} failed: {reason}")]
    WriterFailed { name: String, reason: String },

    // === Configuration Errors ===
    /// Configuration file parsing or validation failed
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    // === I/O Errors ===
    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    // === Internal Errors ===
    /// Internal error that should not happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl LogheapError {
    /// Returns true if the caller can skip past this error and carry on
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LogheapError::NoMessageStartFound | LogheapError::Io(_))
    }

    /// Returns true if this error should exclude the whole file from the
    /// current ingestion run
    pub fn blacklists_file(&self) -> bool {
        matches!(
            self,
            LogheapError::Io(_) | LogheapError::DateParse { .. } | LogheapError::FileNotFound { .. }
        )
    }

    /// Create a date parse error
    pub fn date_parse(value: &[u8], format: impl Into<String>) -> Self {
        LogheapError::DateParse {
            value: String::from_utf8_lossy(value).into_owned(),
            format: format.into(),
        }
    }

    /// Create a query syntax error
    pub fn syntax(position: usize, reason: impl Into<String>) -> Self {
        LogheapError::QuerySyntax {
            position,
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(reason: impl Into<String>) -> Self {
        LogheapError::Serialization(reason.into())
    }
}

impl From<bincode::Error> for LogheapError {
    fn from(err: bincode::Error) -> Self {
        LogheapError::Serialization(err.to_string())
    }
}
