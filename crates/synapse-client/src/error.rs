//! Client error types

use synapse_storage::StorageError;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Storage operation failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

impl ClientError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_not_found())
    }

    /// Check if retrying may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_pass_through() {
        let err = ClientError::from(StorageError::DataSetNotFound(7));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "data set 7 does not exist");

        let err = ClientError::Config("copies must be at least 1".into());
        assert!(!err.is_not_found());
        assert!(!err.is_retryable());
    }
}
