/*
    reconciler.rs - Pending queue drain

    Applies a principal's pending membership entries for one type to its
    personal index. Runs before any mirror for that (type, principal) scope
    is marked Ready so the mirror never exposes partially reconciled
    membership.

    Entries are independent: each one is claimed, then applied, on its own,
    and one failure does not block the rest. A claim removes the entry only
    if it still says the same thing, so a change withdrawn concurrently is
    never applied. Failed entries are put back and stay queued. They are not
    retried here; the next drain picks them up again.
*/

use super::queue::{self, PendingQueueEntry};
use crate::core_mirror::errors::{AggregateFailure, FailedTarget, MirrorResult};
use crate::core_policy::PrincipalContext;
use crate::core_remote::{RemoteStore, StoreResult};
use crate::metrics;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entries applied by one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: Vec<PendingQueueEntry>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Queue reconciler for one (type, principal) scope
#[derive(Clone)]
pub struct UserQueueReconciler {
    store: Arc<dyn RemoteStore>,
    principal: Arc<PrincipalContext>,
    type_name: String,
}

impl UserQueueReconciler {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        principal: Arc<PrincipalContext>,
        type_name: impl Into<String>,
    ) -> Self {
        UserQueueReconciler {
            store,
            principal,
            type_name: type_name.into(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn principal_id(&self) -> &str {
        self.principal.id()
    }

    /// Claim and apply every pending entry of this scope
    ///
    /// Succeeds only if every entry resolved. Otherwise returns an aggregate
    /// failure naming the record ids whose entries are still pending.
    pub async fn drain(&self) -> MirrorResult<DrainReport> {
        let entries =
            queue::list(self.store.as_ref(), self.principal.id(), &self.type_name).await?;
        if entries.is_empty() {
            return Ok(DrainReport::default());
        }

        let attempted = entries.len();
        let results = join_all(entries.into_iter().map(|entry| async move {
            let result = self.apply(&entry).await;
            (entry, result)
        }))
        .await;

        let mut report = DrainReport::default();
        let mut failures = Vec::new();
        for (entry, result) in results {
            match result {
                Ok(true) => report.applied.push(entry),
                Ok(false) => {}
                Err(e) => failures.push(FailedTarget {
                    target: entry.record_id,
                    cause: e.to_string(),
                }),
            }
        }

        metrics::record_counter(metrics::QUEUE_APPLIED, report.applied.len() as u64);
        if failures.is_empty() {
            info!(
                principal = %self.principal.id(),
                type_name = %self.type_name,
                applied = report.applied.len(),
                "pending queue drained"
            );
            return Ok(report);
        }

        metrics::record_counter(metrics::QUEUE_FAILED, failures.len() as u64);
        warn!(
            principal = %self.principal.id(),
            type_name = %self.type_name,
            applied = report.applied.len(),
            failed = failures.len(),
            "pending queue drain incomplete"
        );
        Err(AggregateFailure::new(attempted, failures).into())
    }

    /// Claim one entry, then apply it to the personal index
    ///
    /// Returns false when the entry was withdrawn before it could be claimed.
    pub async fn apply(&self, entry: &PendingQueueEntry) -> StoreResult<bool> {
        if !queue::claim(self.store.as_ref(), entry).await? {
            debug!(record_id = %entry.record_id, "queue entry withdrawn before apply");
            return Ok(false);
        }

        let index_path = entry.index_path();
        let written = if entry.desired {
            self.store.set(&index_path, Value::Bool(true)).await
        } else {
            self.store.remove(&index_path).await
        };
        if let Err(e) = written {
            if let Err(restore_err) = queue::restore(self.store.as_ref(), entry).await {
                warn!(
                    record_id = %entry.record_id,
                    error = %restore_err,
                    "could not put failed queue entry back"
                );
            }
            return Err(e);
        }

        self.principal
            .set_index_flag(&entry.type_name, &entry.record_id, entry.desired)
            .await;
        debug!(
            record_id = %entry.record_id,
            desired = entry.desired,
            "queue entry applied"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_mirror::errors::MirrorError;
    use crate::core_policy::Principal;
    use crate::core_remote::{MemoryStore, StorePath};
    use serde_json::json;

    fn setup(data: Value) -> (Arc<MemoryStore>, Arc<PrincipalContext>, UserQueueReconciler) {
        let store = Arc::new(MemoryStore::with_data(data));
        let principal = PrincipalContext::new(Principal::new("u1").with_indexed("orders", "o5"));
        let reconciler = UserQueueReconciler::new(store.clone(), principal.clone(), "orders");
        (store, principal, reconciler)
    }

    #[tokio::test]
    async fn test_drain_applies_both_directions() {
        let (store, principal, reconciler) = setup(json!({
            "users": { "u1": {
                "orders": { "o5": true },
                "dataQueue": { "orders": { "o5": false, "o9": true } }
            } }
        }));

        let report = reconciler.drain().await.unwrap();
        assert_eq!(report.applied.len(), 2);

        let state = principal.read().await;
        assert!(!state.index.contains("orders", "o5"));
        assert!(state.index.contains("orders", "o9"));
        drop(state);

        assert_eq!(
            store.get(&StorePath::profile("u1")).await.unwrap(),
            Some(json!({ "orders": { "o9": true } }))
        );
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_store, _principal, reconciler) = setup(json!({}));
        assert!(reconciler.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_entry_stays_queued_and_others_apply() {
        let (store, principal, reconciler) = setup(json!({
            "users": { "u1": { "dataQueue": { "orders": { "o1": true, "o2": true } } } }
        }));
        store.fail_writes_under(StorePath::user_index("u1", "orders").child("o2"), "rules");

        let err = reconciler.drain().await.unwrap_err();
        match err {
            MirrorError::Aggregate(failure) => {
                assert_eq!(failure.attempted, 2);
                assert_eq!(failure.failed_targets(), vec!["o2"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(principal.read().await.index.contains("orders", "o1"));
        let pending = queue::list(store.as_ref(), "u1", "orders").await.unwrap();
        assert_eq!(pending, vec![PendingQueueEntry::new("u1", "orders", "o2", true)]);

        // No retry happens on its own; a later drain resolves it.
        store.clear_failures();
        let report = reconciler.drain().await.unwrap();
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawn_entry_is_not_applied() {
        let (store, principal, reconciler) = setup(json!({
            "users": { "u1": { "dataQueue": { "orders": { "o9": true } } } }
        }));
        let listed = queue::list(store.as_ref(), "u1", "orders").await.unwrap();

        // The sharer withdraws between the owner listing and applying.
        let cancel = PendingQueueEntry::new("u1", "orders", "o9", false);
        assert_eq!(
            queue::enqueue(store.as_ref(), &cancel).await.unwrap(),
            queue::QueueWrite::Cancelled
        );

        assert!(!reconciler.apply(&listed[0]).await.unwrap());
        assert!(!principal.read().await.index.contains("orders", "o9"));
        assert_eq!(store.dump(), json!({}));
    }

    #[tokio::test]
    async fn test_other_scopes_untouched() {
        let (store, _principal, reconciler) = setup(json!({
            "users": { "u1": { "dataQueue": { "invoices": { "i1": true } } } }
        }));
        assert!(reconciler.drain().await.unwrap().is_empty());
        assert_eq!(
            queue::list(store.as_ref(), "u1", "invoices").await.unwrap().len(),
            1
        );
    }
}
