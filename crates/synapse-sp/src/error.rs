//! Error types for the synapse-sp crate

use synapse_piece::PieceError;
use thiserror::Error;

/// Result type alias using `SpError`
pub type Result<T> = std::result::Result<T, SpError>;

/// Errors returned by storage-provider operations
#[derive(Error, Debug, Clone)]
pub enum SpError {
    /// HTTP transport error
    #[error("http error: {0}")]
    Http(String),

    /// Could not reach the provider
    #[error("connection error: {0}")]
    Connection(String),

    /// A single request exceeded the client timeout
    #[error("request timed out: {0}")]
    RequestTimeout(String),

    /// A polling or retry loop ran past its deadline
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Provider answered with a non-success status
    #[error("provider returned {status} for {operation}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    /// Piece is not (yet) known to the provider
    #[error("piece not found on provider: {0}")]
    PieceNotFound(String),

    /// On-chain transaction was rejected or reverted
    #[error("transaction {tx_hash} rejected: {reason}")]
    Rejected { tx_hash: String, reason: String },

    /// Provider-to-provider pull ended in failure
    #[error("pull failed: {0}")]
    PullFailed(String),

    /// Response body did not have the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Piece identifier error
    #[error("piece error: {0}")]
    Piece(#[from] PieceError),

    /// Caller cancelled the operation
    #[error("operation aborted")]
    Aborted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SpError {
    /// Whether a retry of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Connection(_) | Self::RequestTimeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PieceNotFound(_))
            || matches!(self, Self::Status { status, .. } if *status == 404)
    }
}

impl From<reqwest::Error> for SpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SpError::RequestTimeout(err.to_string())
        } else if err.is_connect() {
            SpError::Connection(err.to_string())
        } else if err.is_decode() {
            SpError::InvalidResponse(err.to_string())
        } else {
            SpError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SpError {
    fn from(err: serde_json::Error) -> Self {
        SpError::Serialization(err.to_string())
    }
}
