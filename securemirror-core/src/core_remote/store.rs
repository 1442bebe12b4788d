//! The remote store contract consumed by the mirror

use super::errors::StoreResult;
use super::event::{Subscription, SubscriptionId};
use super::path::StorePath;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// What a transaction update decided for the current value
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionUpdate {
    /// Leave the node untouched
    Abort,
    /// Replace the node; `Value::Null` deletes it
    Set(Value),
}

/// Outcome of [`RemoteStore::transaction`]
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    pub committed: bool,
    /// Value at the path once the transaction finished
    pub value: Option<Value>,
}

/// Update function handed to [`RemoteStore::transaction`]
pub type TransactionFn<'a> = &'a mut (dyn FnMut(Option<&Value>) -> TransactionUpdate + Send);

/// Path-addressable, push-based, asynchronous store
///
/// Implementations must deliver events for one path in commit order. No
/// ordering is assumed across sibling paths. A fresh subscription first
/// reports a `child_added` for every existing child, then one `value`.
/// Writing `null` (or an empty object) deletes the node.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Allocate a new, chronologically sortable child key
    fn push_id(&self) -> String;

    /// Read the current value once
    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>>;

    /// Replace the value at `path`
    async fn set(&self, path: &StorePath, value: Value) -> StoreResult<()>;

    /// Merge `fields` into the object at `path`
    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> StoreResult<()>;

    /// Delete the node at `path`
    async fn remove(&self, path: &StorePath) -> StoreResult<()>;

    /// Atomically read-modify-write the node at `path`
    ///
    /// `update` sees the current value and decides what to write. Stores
    /// with optimistic concurrency may call it more than once.
    async fn transaction(
        &self,
        path: &StorePath,
        update: TransactionFn<'_>,
    ) -> StoreResult<TransactionResult>;

    /// Subscribe to every change kind on `path`
    async fn on(&self, path: &StorePath) -> StoreResult<Subscription>;

    /// Release a subscription
    async fn off(&self, id: SubscriptionId);
}
