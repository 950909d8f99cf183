//! Error types for the synapse-piece crate

use thiserror::Error;

/// Result type alias using `PieceError`
pub type Result<T> = std::result::Result<T, PieceError>;

/// Errors raised while parsing or validating pieces
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PieceError {
    /// The string is not a valid content identifier
    #[error("invalid piece CID: {0}")]
    InvalidCid(String),

    /// The CID parsed but does not use a supported codec/hash
    #[error("unsupported piece CID {cid}: {reason}")]
    Unsupported { cid: String, reason: String },

    /// Upload payload is outside the accepted size window
    #[error("piece size {size} bytes is outside the allowed range [{min}, {max}]")]
    SizeOutOfBounds { size: u64, min: u64, max: u64 },

    /// Downloaded bytes do not hash to the requested piece
    #[error("piece mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },
}
