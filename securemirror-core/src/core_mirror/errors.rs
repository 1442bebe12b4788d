//! Error types for mirror operations
//!
//! Read-side denials never become errors: a record the principal may not
//! see is simply absent. Only writes, and operations naming an id that is
//! not visible, surface failures.

use crate::core_policy::PolicyError;
use crate::core_remote::StoreError;
use std::fmt;
use thiserror::Error;

/// Result type for mirror operations
pub type MirrorResult<T> = Result<T, MirrorError>;

/// Errors surfaced by the mirror facade, the updater and the reconciler
#[derive(Debug, Error)]
pub enum MirrorError {
    /// The write was refused by the local permission gate
    #[error("Permission denied: {principal} cannot {action} in {type_name}")]
    PermissionDenied {
        principal: String,
        action: String,
        type_name: String,
    },

    /// The id is absent or not visible to this principal
    #[error("Not found: {type_name}/{id}")]
    NotFound { type_name: String, id: String },

    /// The underlying store call failed
    #[error("Remote failure: {0}")]
    Remote(#[from] StoreError),

    /// At least one target of a multi-target operation failed
    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),

    /// The mirror was destroyed before or during the operation
    #[error("Mirror for '{0}' has been torn down")]
    TornDown(String),

    /// No policy is configured for the type
    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

/// One failed sub-target of a multi-target operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTarget {
    pub target: String,
    pub cause: String,
}

/// Failure of a best-effort multi-target operation
///
/// Targets that succeeded stay applied; nothing is rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFailure {
    pub attempted: usize,
    pub failures: Vec<FailedTarget>,
}

impl AggregateFailure {
    pub fn new(attempted: usize, failures: Vec<FailedTarget>) -> Self {
        AggregateFailure {
            attempted,
            failures,
        }
    }

    /// Identifiers of the failed targets
    pub fn failed_targets(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.target.as_str()).collect()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} targets failed: ",
            self.failures.len(),
            self.attempted
        )?;
        let parts: Vec<String> = self
            .failures
            .iter()
            .map(|failure| format!("{} ({})", failure.target, failure.cause))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl std::error::Error for AggregateFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = MirrorError::NotFound {
            type_name: "orders".to_string(),
            id: "o1".to_string(),
        };
        assert_eq!(err.to_string(), "Not found: orders/o1");
    }

    #[test]
    fn test_aggregate_display_and_targets() {
        let failure = AggregateFailure::new(
            3,
            vec![FailedTarget {
                target: "u2".to_string(),
                cause: "rejected".to_string(),
            }],
        );
        assert_eq!(failure.to_string(), "1 of 3 targets failed: u2 (rejected)");
        assert_eq!(failure.failed_targets(), vec!["u2"]);

        let err: MirrorError = failure.into();
        assert!(matches!(err, MirrorError::Aggregate(_)));
    }

    #[test]
    fn test_store_error_conversion() {
        let err: MirrorError = StoreError::Unavailable("offline".to_string()).into();
        assert!(err.to_string().contains("offline"));
    }
}
