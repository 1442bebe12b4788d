/*
    core_remote - Remote store adapter

    The hierarchical push-notification store the mirror replicates from.
    The store itself is external; this module defines the contract the mirror
    consumes plus an in-memory implementation used by tests and the CLI.
*/

pub mod errors;
pub mod event;
pub mod memory;
pub mod path;
pub mod store;

pub use errors::{StoreError, StoreResult};
pub use event::{ChangeKind, RemoteEvent, Subscription, SubscriptionId};
pub use memory::MemoryStore;
pub use path::{StorePath, ACCOUNTS_ROOT, LINKED_KEY, QUEUE_KEY, ROLES_KEY, USERS_ROOT};
pub use store::{RemoteStore, TransactionFn, TransactionResult, TransactionUpdate};
