//! SecureMirror core
//!
//! Client-side, permission-filtered replicas of a remote hierarchical
//! push-notification store, with cross-principal membership reconciliation.

pub mod config;
pub mod core_membership;
pub mod core_mirror;
pub mod core_policy;
pub mod core_remote;
pub mod logging;
pub mod metrics;
pub mod session;

#[doc(hidden)]
pub mod test_utils;

pub use config::{Config, ConfigError};
pub use core_mirror::{
    EventKind, MirrorContext, MirrorError, MirrorEvent, MirrorResult, MirrorState, SecureMirror,
    Snapshot, WriteOutcome,
};
pub use core_policy::{Grant, GrantPrecedence, PermissionEvaluator, Principal, TypePolicy};
pub use core_remote::{MemoryStore, RemoteStore, StorePath, TransactionResult, TransactionUpdate};
pub use logging::{init_logging, LogLevel};
pub use session::{LoginOutcome, Session};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = GrantPrecedence::default();
        assert_eq!(StorePath::type_root("orders").to_string(), "/orders");
    }
}
