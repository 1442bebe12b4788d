/*
    queue.rs - Pending membership queue

    An acting principal cannot write into another principal's personal
    index. Instead it leaves a boolean entry at
    /users/{principalId}/dataQueue/{typeName}/{recordId}; the owner applies
    it the next time a mirror for that type is opened (or live, while one is).
*/

use crate::core_policy::is_truthy;
use crate::core_remote::{RemoteStore, StorePath, StoreResult, TransactionUpdate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// A deferred membership change for one principal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingQueueEntry {
    pub principal_id: String,
    pub type_name: String,
    pub record_id: String,
    pub desired: bool,
}

impl PendingQueueEntry {
    pub fn new(
        principal_id: impl Into<String>,
        type_name: impl Into<String>,
        record_id: impl Into<String>,
        desired: bool,
    ) -> Self {
        PendingQueueEntry {
            principal_id: principal_id.into(),
            type_name: type_name.into(),
            record_id: record_id.into(),
            desired,
        }
    }

    /// Where this entry is stored
    pub fn path(&self) -> StorePath {
        StorePath::user_queue(&self.principal_id, &self.type_name).child(&self.record_id)
    }

    /// The personal index flag this entry resolves into
    pub fn index_path(&self) -> StorePath {
        StorePath::user_index(&self.principal_id, &self.type_name).child(&self.record_id)
    }
}

/// What enqueuing did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWrite {
    /// The entry was written
    Enqueued,
    /// An opposite entry was pending and has been withdrawn instead
    Cancelled,
}

/// Entries pending for one (principal, type) scope, in record-id order
pub async fn list(
    store: &dyn RemoteStore,
    principal_id: &str,
    type_name: &str,
) -> StoreResult<Vec<PendingQueueEntry>> {
    let stored = store
        .get(&StorePath::user_queue(principal_id, type_name))
        .await?;

    let entries = stored
        .as_ref()
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(record_id, flag)| {
                    PendingQueueEntry::new(principal_id, type_name, record_id, is_truthy(flag))
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

/// Write `entry`, or withdraw a pending entry with the opposite desire
///
/// Runs as one store transaction, so a concurrent claim by the owner either
/// happens before (and this writes a fresh entry) or after (and sees it).
pub async fn enqueue(store: &dyn RemoteStore, entry: &PendingQueueEntry) -> StoreResult<QueueWrite> {
    let path = entry.path();
    let desired = entry.desired;
    let mut outcome = QueueWrite::Enqueued;
    store
        .transaction(&path, &mut |pending: Option<&Value>| match pending {
            Some(pending) if is_truthy(pending) != desired => {
                outcome = QueueWrite::Cancelled;
                TransactionUpdate::Set(Value::Null)
            }
            _ => {
                outcome = QueueWrite::Enqueued;
                TransactionUpdate::Set(Value::Bool(desired))
            }
        })
        .await?;
    match outcome {
        QueueWrite::Cancelled => debug!(%path, "withdrew opposite pending entry"),
        QueueWrite::Enqueued => debug!(%path, desired, "queued membership change"),
    }
    Ok(outcome)
}

/// Take ownership of an entry before applying it
///
/// Removes the entry only while it still carries the same desire. Returns
/// false when it was withdrawn or flipped in the meantime.
pub async fn claim(store: &dyn RemoteStore, entry: &PendingQueueEntry) -> StoreResult<bool> {
    let desired = entry.desired;
    let result = store
        .transaction(&entry.path(), &mut |pending: Option<&Value>| match pending {
            Some(pending) if is_truthy(pending) == desired => TransactionUpdate::Set(Value::Null),
            _ => TransactionUpdate::Abort,
        })
        .await?;
    Ok(result.committed)
}

/// Put a claimed entry back after its application failed
///
/// Leaves the slot alone if someone queued a newer change meanwhile.
pub async fn restore(store: &dyn RemoteStore, entry: &PendingQueueEntry) -> StoreResult<bool> {
    let desired = entry.desired;
    let result = store
        .transaction(&entry.path(), &mut |pending: Option<&Value>| match pending {
            None => TransactionUpdate::Set(Value::Bool(desired)),
            Some(_) => TransactionUpdate::Abort,
        })
        .await?;
    Ok(result.committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_remote::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_reads_boolean_payloads() {
        let store = MemoryStore::with_data(json!({
            "users": { "u1": { "dataQueue": { "orders": { "o1": true, "o2": false } } } }
        }));
        let entries = list(&store, "u1", "orders").await.unwrap();
        assert_eq!(
            entries,
            vec![
                PendingQueueEntry::new("u1", "orders", "o1", true),
                PendingQueueEntry::new("u1", "orders", "o2", false),
            ]
        );
        assert!(list(&store, "u1", "invoices").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_then_opposite_cancels() {
        let store = MemoryStore::new();
        let add = PendingQueueEntry::new("u2", "orders", "o1", true);
        let remove = PendingQueueEntry::new("u2", "orders", "o1", false);

        assert_eq!(enqueue(&store, &add).await.unwrap(), QueueWrite::Enqueued);
        assert_eq!(store.get(&add.path()).await.unwrap(), Some(json!(true)));

        assert_eq!(enqueue(&store, &remove).await.unwrap(), QueueWrite::Cancelled);
        assert!(list(&store, "u2", "orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_same_desire_is_idempotent() {
        let store = MemoryStore::new();
        let add = PendingQueueEntry::new("u2", "orders", "o1", true);
        enqueue(&store, &add).await.unwrap();
        assert_eq!(enqueue(&store, &add).await.unwrap(), QueueWrite::Enqueued);
        assert_eq!(list(&store, "u2", "orders").await.unwrap().len(), 1);

        assert!(claim(&store, &add).await.unwrap());
        assert!(list(&store, "u2", "orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_refuses_withdrawn_or_flipped_entries() {
        let store = MemoryStore::new();
        let add = PendingQueueEntry::new("u2", "orders", "o1", true);
        let remove = PendingQueueEntry::new("u2", "orders", "o1", false);

        // Withdrawn before the owner got to it.
        enqueue(&store, &add).await.unwrap();
        enqueue(&store, &remove).await.unwrap();
        assert!(!claim(&store, &add).await.unwrap());

        // Flipped: only the current desire can be claimed.
        enqueue(&store, &remove).await.unwrap();
        assert!(!claim(&store, &add).await.unwrap());
        assert_eq!(store.get(&remove.path()).await.unwrap(), Some(json!(false)));
        assert!(claim(&store, &remove).await.unwrap());
    }

    #[tokio::test]
    async fn test_opposite_after_claim_is_queued_not_lost() {
        let store = MemoryStore::new();
        let add = PendingQueueEntry::new("u2", "orders", "o1", true);
        let remove = PendingQueueEntry::new("u2", "orders", "o1", false);
        enqueue(&store, &add).await.unwrap();

        // The owner claimed the add; a removal arriving now must survive.
        assert!(claim(&store, &add).await.unwrap());
        assert_eq!(enqueue(&store, &remove).await.unwrap(), QueueWrite::Enqueued);
        assert_eq!(
            list(&store, "u2", "orders").await.unwrap(),
            vec![remove.clone()]
        );

        // A failed apply of the add does not clobber the newer removal.
        assert!(!restore(&store, &add).await.unwrap());
        assert_eq!(store.get(&remove.path()).await.unwrap(), Some(json!(false)));
    }
}
