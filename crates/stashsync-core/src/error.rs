//! Error types for the stashsync engine

use std::time::Duration;
use thiserror::Error;

/// Main error type for stashsync operations
#[derive(Error, Debug)]
pub enum StashError {
    /// Underlying storage handle failed and could not be recovered
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Encryption was required by policy but is not possible
    /// (signer lacks the capability, or the cipher failed).
    /// This is always surfaced; it never degrades to a plaintext write.
    #[error("Encryption unavailable: nothing was stored ({0})")]
    EncryptionUnavailable(String),

    /// Decryption failed (wrong key, tampered data, or malformed input)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Record failed required-field or payload-shape validation
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// A single network operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Relay transport rejected or dropped the operation
    #[error("Transport error: {0}")]
    Transport(String),

    /// The external signer rejected or failed the request
    #[error("Signer error: {0}")]
    Signer(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using StashError
pub type StashResult<T> = Result<T, StashError>;

impl From<redb::DatabaseError> for StashError {
    fn from(e: redb::DatabaseError) -> Self {
        StashError::StorageUnavailable(e.to_string())
    }
}

impl From<redb::TransactionError> for StashError {
    fn from(e: redb::TransactionError) -> Self {
        StashError::StorageUnavailable(e.to_string())
    }
}

impl From<redb::TableError> for StashError {
    fn from(e: redb::TableError) -> Self {
        StashError::StorageUnavailable(e.to_string())
    }
}

impl From<redb::StorageError> for StashError {
    fn from(e: redb::StorageError) -> Self {
        StashError::StorageUnavailable(e.to_string())
    }
}

impl From<redb::CommitError> for StashError {
    fn from(e: redb::CommitError) -> Self {
        StashError::StorageUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StashError::EncryptionUnavailable("signer has no decrypt support".to_string());
        assert_eq!(
            format!("{}", err),
            "Encryption unavailable: nothing was stored (signer has no decrypt support)"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StashError = io_err.into();
        assert!(matches!(err, StashError::Io(_)));
    }

    #[test]
    fn test_cancelled_is_distinguishable() {
        let err = StashError::Cancelled;
        assert!(matches!(err, StashError::Cancelled));
        assert_eq!(format!("{}", err), "Operation cancelled");
    }
}
