/*
    errors.rs - Error types for the remote store adapter

    Every call into the remote store is asynchronous and may fail.
    Timeouts are owned by the adapter, not by the mirror.
*/

use thiserror::Error;

/// Errors reported by a [`RemoteStore`](super::RemoteStore) implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store refused the write (rules, quota, injected failure)
    #[error("Write rejected at {path}: {reason}")]
    Rejected { path: String, reason: String },

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A path could not be parsed or addressed
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Value could not be encoded for the store
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for remote store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Rejected {
            path: "orders/o1".to_string(),
            reason: "read-only".to_string(),
        };
        assert_eq!(err.to_string(), "Write rejected at orders/o1: read-only");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StoreError = parse_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
