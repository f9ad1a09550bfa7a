//! Error types for chunked logical files

use thiserror::Error;

/// Result type alias for chunked-storage operations
pub type Result<T> = std::result::Result<T, ChunkError>;

/// Error types that can occur while listing or reading chunked files
#[derive(Error, Debug, Clone)]
pub enum ChunkError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to fetch chunk {address} after {attempts} attempts (status: {status:?}): {message}")]
    ChunkFetchFailed {
        address: String,
        status: Option<u16>,
        attempts: usize,
        message: String,
    },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    #[error("Read on closed session")]
    SessionClosed,

    #[error("Integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("Fragment group collides with existing entry: {0}")]
    NameCollision(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ChunkError {
    fn from(err: std::io::Error) -> Self {
        ChunkError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ChunkError {
    fn from(err: serde_json::Error) -> Self {
        ChunkError::ParseError(err.to_string())
    }
}

impl ChunkError {
    /// Determine if a single fetch attempt that failed with this error is worth
    /// repeating
    ///
    /// Network failures, timeouts and any non-200 upstream status are transient.
    /// Cancellation, size mismatches and everything raised by the reader itself
    /// are not.
    pub fn should_retry(&self) -> bool {
        match self {
            ChunkError::UpstreamStatus { .. } => true,
            ChunkError::HttpError(_) => true,
            ChunkError::Timeout(_) => true,
            ChunkError::IoError(_) => true,

            ChunkError::Cancelled => false,
            ChunkError::ChunkSizeMismatch { .. } => false,
            ChunkError::ChunkFetchFailed { .. } => false, // Already exhausted retries
            ChunkError::ConfigError(_) => false,
            ChunkError::InvalidRange(_) => false,
            ChunkError::SessionClosed => false,
            ChunkError::IntegrityCheckFailed { .. } => false,
            ChunkError::NameCollision(_) => false,
            ChunkError::ParseError(_) => false,
            ChunkError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status the file-serving layer should answer with
    ///
    /// - Invalid ranges: 416 Range Not Satisfiable
    /// - Upstream fetch failures: 502 Bad Gateway
    /// - Timeouts: 504 Gateway Timeout
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ChunkError::InvalidRange(_) => 416,

            ChunkError::ChunkFetchFailed { .. } => 502,
            ChunkError::UpstreamStatus { .. } => 502,
            ChunkError::HttpError(_) => 502,
            ChunkError::ChunkSizeMismatch { .. } => 502,
            ChunkError::IntegrityCheckFailed { .. } => 502,
            ChunkError::Timeout(_) => 504,

            // nginx convention for a client that went away
            ChunkError::Cancelled => 499,

            ChunkError::ParseError(_) => 400,

            ChunkError::ConfigError(_) => 500,
            ChunkError::SessionClosed => 500,
            ChunkError::NameCollision(_) => 500,
            ChunkError::IoError(_) => 500,
            ChunkError::InternalError(_) => 500,
        }
    }

    /// Create an error from a non-success upstream status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        ChunkError::UpstreamStatus {
            status,
            message: message.into(),
        }
    }

    /// Upstream status carried by this error, if any
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ChunkError::UpstreamStatus { status, .. } => Some(*status),
            ChunkError::ChunkFetchFailed { status, .. } => *status,
            _ => None,
        }
    }
}
