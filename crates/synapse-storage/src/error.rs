//! Error types for the synapse-storage crate

use crate::types::{CopyFailure, DataSetId, ProviderId};
use std::sync::Arc;
use synapse_piece::PieceError;
use synapse_sp::SpError;
use thiserror::Error;

/// Result type alias using `StorageError`
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while resolving, uploading or retrieving pieces
#[derive(Error, Debug)]
pub enum StorageError {
    /// Data set does not exist or has no backing payment rail
    #[error("data set {0} does not exist")]
    DataSetNotFound(DataSetId),

    /// Provider not registered or not approved
    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    /// Piece unknown to the provider or data set
    #[error("piece not found: {0}")]
    PieceNotFound(String),

    /// Inconsistent or malformed options
    #[error("validation error: {0}")]
    Validation(String),

    /// Payload outside the accepted upload window
    #[error("size {size} bytes is outside the allowed range [{min}, {max}]")]
    SizeOutOfBounds { size: u64, min: u64, max: u64 },

    /// Malformed piece identifier or bytes that do not match it
    #[error("invalid piece: {0}")]
    InvalidPiece(String),

    /// Data set belongs to another payer
    #[error("data set {data_set_id} is owned by {owner}, not {caller}")]
    NotOwner {
        data_set_id: DataSetId,
        owner: String,
        caller: String,
    },

    /// Requested provider disagrees with the data set's provider
    #[error("data set {data_set_id} belongs to provider {actual}, not {requested}")]
    ProviderMismatch {
        data_set_id: DataSetId,
        actual: String,
        requested: String,
    },

    /// Requested CDN setting disagrees with the data set's
    #[error("data set {data_set_id} has withCDN={actual}, requested withCDN={requested}")]
    CdnMismatch {
        data_set_id: DataSetId,
        actual: bool,
        requested: bool,
    },

    /// Data set has been terminated and cannot take new pieces
    #[error("data set {0} is terminated")]
    DataSetTerminated(DataSetId),

    /// Deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),

    /// Storage provider error
    #[error("provider error: {0}")]
    Provider(SpError),

    /// Chain read or write failed
    #[error("chain error: {0}")]
    Chain(String),

    /// Primary store failed; nothing was recorded anywhere
    #[error("store failed on provider {provider_id} ({endpoint}): {reason}")]
    Store {
        provider_id: ProviderId,
        endpoint: String,
        reason: String,
    },

    /// Piece is stored off-chain but every commit failed
    #[error("commit failed on all {} providers", .failures.len())]
    Commit { failures: Vec<CopyFailure> },

    /// Commit succeeded but the piece was not among the confirmed ids
    #[error("piece {piece_cid} was not confirmed in data set {data_set_id}")]
    Unconfirmed {
        piece_cid: String,
        data_set_id: DataSetId,
    },

    /// Provider pool exhausted during selection
    #[error("no providers available: {0}")]
    NoProvidersAvailable(String),

    /// Every retrieval strategy failed
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// The batch this piece was queued in failed as a whole
    #[error("batch of {pieces} pieces failed: {source}")]
    BatchFailed {
        pieces: usize,
        #[source]
        source: Arc<StorageError>,
    },

    /// Caller cancelled the operation
    #[error("operation aborted")]
    Aborted,

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    /// Whether the error means something does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::DataSetNotFound(_) | Self::ProviderNotFound(_) | Self::PieceNotFound(_) => true,
            Self::Provider(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Provider(e) => e.is_retryable(),
            Self::BatchFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<SpError> for StorageError {
    fn from(err: SpError) -> Self {
        match err {
            SpError::Aborted => StorageError::Aborted,
            SpError::Timeout { .. } => StorageError::Timeout(err.to_string()),
            SpError::PieceNotFound(piece) => StorageError::PieceNotFound(piece),
            SpError::Piece(e) => e.into(),
            other => StorageError::Provider(other),
        }
    }
}

impl From<PieceError> for StorageError {
    fn from(err: PieceError) -> Self {
        match err {
            PieceError::SizeOutOfBounds { size, min, max } => {
                StorageError::SizeOutOfBounds { size, min, max }
            }
            other => StorageError::InvalidPiece(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sp_errors_are_mapped() {
        assert!(matches!(StorageError::from(SpError::Aborted), StorageError::Aborted));
        assert!(matches!(
            StorageError::from(SpError::Timeout {
                operation: "wait for piece".into(),
                seconds: 300
            }),
            StorageError::Timeout(_)
        ));
        let not_found = StorageError::from(SpError::PieceNotFound("bafk".into()));
        assert!(not_found.is_not_found());
    }

    #[test]
    fn test_size_error_is_preserved() {
        let err = StorageError::from(PieceError::SizeOutOfBounds {
            size: 126,
            min: 127,
            max: 1024,
        });
        assert!(matches!(err, StorageError::SizeOutOfBounds { size: 126, .. }));
    }

    #[test]
    fn test_batch_failure_shares_cause() {
        let cause = Arc::new(StorageError::Provider(SpError::Connection("reset".into())));
        let a = StorageError::BatchFailed {
            pieces: 2,
            source: Arc::clone(&cause),
        };
        let b = StorageError::BatchFailed {
            pieces: 2,
            source: Arc::clone(&cause),
        };
        assert!(a.is_retryable() && b.is_retryable());
        assert_eq!(Arc::strong_count(&cause), 3);
        assert!(a.to_string().contains("reset"));
    }

    #[test]
    fn test_commit_error_counts_failures() {
        let err = StorageError::Commit { failures: vec![] };
        assert_eq!(err.to_string(), "commit failed on all 0 providers");
    }
}
