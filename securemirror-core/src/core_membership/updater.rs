//! Propagates membership changes after a write
//!
//! The acting principal's own index is written directly. Every other
//! principal gets a pending queue entry, because the acting principal has no
//! write authority over another principal's index.

use super::queue::{self, PendingQueueEntry, QueueWrite};
use crate::core_mirror::errors::{AggregateFailure, FailedTarget, MirrorResult};
use crate::core_policy::PrincipalContext;
use crate::core_remote::{RemoteStore, StorePath, StoreResult};
use crate::metrics;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened for one principal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipAction {
    /// Acting principal's index flag written
    Indexed,
    /// Acting principal's index flag removed
    Unindexed,
    /// Pending entry written for another principal
    Queued,
    /// An opposite pending entry was withdrawn
    Withdrawn,
}

/// Per-principal outcome of one propagation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipReport {
    pub outcomes: BTreeMap<String, MembershipAction>,
}

impl MembershipReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn action_for(&self, principal_id: &str) -> Option<MembershipAction> {
        self.outcomes.get(principal_id).copied()
    }

    fn merge(&mut self, other: MembershipReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Membership updater for one (type, acting principal) pair
#[derive(Clone)]
pub struct UsersMembershipUpdater {
    store: Arc<dyn RemoteStore>,
    acting: Option<Arc<PrincipalContext>>,
    type_name: String,
}

impl UsersMembershipUpdater {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        acting: Arc<PrincipalContext>,
        type_name: impl Into<String>,
    ) -> Self {
        UsersMembershipUpdater {
            store,
            acting: Some(acting),
            type_name: type_name.into(),
        }
    }

    /// Updater for writes made without a principal; every member is queued
    pub fn anonymous(store: Arc<dyn RemoteStore>, type_name: impl Into<String>) -> Self {
        UsersMembershipUpdater {
            store,
            acting: None,
            type_name: type_name.into(),
        }
    }

    /// Grant `record_id` to every principal in `principal_ids`
    pub async fn add(
        &self,
        record_id: &str,
        principal_ids: &BTreeSet<String>,
    ) -> MirrorResult<MembershipReport> {
        self.propagate(record_id, principal_ids, true).await
    }

    /// Withdraw `record_id` from every principal in `principal_ids`
    pub async fn remove(
        &self,
        record_id: &str,
        principal_ids: &BTreeSet<String>,
    ) -> MirrorResult<MembershipReport> {
        self.propagate(record_id, principal_ids, false).await
    }

    /// Apply both halves of a membership diff; removals settle after additions
    pub async fn apply_diff(
        &self,
        record_id: &str,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) -> MirrorResult<MembershipReport> {
        let mut report = self.add(record_id, added).await?;
        report.merge(self.remove(record_id, removed).await?);
        Ok(report)
    }

    async fn propagate(
        &self,
        record_id: &str,
        principal_ids: &BTreeSet<String>,
        desired: bool,
    ) -> MirrorResult<MembershipReport> {
        if principal_ids.is_empty() {
            return Ok(MembershipReport::default());
        }

        let results = join_all(principal_ids.iter().map(|principal_id| async move {
            let result = self.apply_one(record_id, principal_id, desired).await;
            (principal_id.clone(), result)
        }))
        .await;

        let mut report = MembershipReport::default();
        let mut failures = Vec::new();
        for (principal_id, result) in results {
            match result {
                Ok(action) => {
                    report.outcomes.insert(principal_id, action);
                }
                Err(e) => failures.push(FailedTarget {
                    target: principal_id,
                    cause: e.to_string(),
                }),
            }
        }

        if failures.is_empty() {
            debug!(
                type_name = %self.type_name,
                record_id,
                desired,
                principals = report.outcomes.len(),
                "membership propagated"
            );
            return Ok(report);
        }

        warn!(
            type_name = %self.type_name,
            record_id,
            failed = failures.len(),
            "membership propagation partially failed"
        );
        metrics::record_counter(metrics::MEMBERSHIP_FAILED, failures.len() as u64);
        Err(AggregateFailure::new(principal_ids.len(), failures).into())
    }

    async fn apply_one(
        &self,
        record_id: &str,
        principal_id: &str,
        desired: bool,
    ) -> StoreResult<MembershipAction> {
        if let Some(acting) = self.acting.as_ref().filter(|a| a.id() == principal_id) {
            let path = StorePath::user_index(principal_id, &self.type_name).child(record_id);
            if desired {
                self.store.set(&path, Value::Bool(true)).await?;
            } else {
                self.store.remove(&path).await?;
            }
            acting
                .set_index_flag(&self.type_name, record_id, desired)
                .await;
            return Ok(if desired {
                MembershipAction::Indexed
            } else {
                MembershipAction::Unindexed
            });
        }

        let entry = PendingQueueEntry::new(principal_id, &self.type_name, record_id, desired);
        let action = match queue::enqueue(self.store.as_ref(), &entry).await? {
            QueueWrite::Enqueued => MembershipAction::Queued,
            QueueWrite::Cancelled => MembershipAction::Withdrawn,
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_membership::queue::list;
    use crate::core_mirror::errors::MirrorError;
    use crate::core_policy::Principal;
    use crate::core_remote::MemoryStore;
    use serde_json::json;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn setup() -> (Arc<MemoryStore>, Arc<PrincipalContext>, UsersMembershipUpdater) {
        let store = Arc::new(MemoryStore::new());
        let acting = PrincipalContext::new(Principal::new("u1"));
        let updater = UsersMembershipUpdater::new(store.clone(), acting.clone(), "orders");
        (store, acting, updater)
    }

    #[tokio::test]
    async fn test_add_writes_own_index_and_queues_others() {
        let (store, acting, updater) = setup();

        let report = updater.add("o1", &ids(&["u1", "u2"])).await.unwrap();
        assert_eq!(report.action_for("u1"), Some(MembershipAction::Indexed));
        assert_eq!(report.action_for("u2"), Some(MembershipAction::Queued));

        assert!(acting.read().await.index.contains("orders", "o1"));
        assert_eq!(
            store
                .get(&StorePath::user_index("u1", "orders").child("o1"))
                .await
                .unwrap(),
            Some(json!(true))
        );
        assert_eq!(
            list(store.as_ref(), "u2", "orders").await.unwrap(),
            vec![PendingQueueEntry::new("u2", "orders", "o1", true)]
        );
    }

    #[tokio::test]
    async fn test_add_then_remove_nets_empty_queue() {
        let (store, acting, updater) = setup();
        let members = ids(&["u1", "u2", "u3"]);

        updater.add("o1", &members).await.unwrap();
        let report = updater.remove("o1", &members).await.unwrap();

        assert_eq!(report.action_for("u1"), Some(MembershipAction::Unindexed));
        assert_eq!(report.action_for("u2"), Some(MembershipAction::Withdrawn));
        assert!(list(store.as_ref(), "u2", "orders").await.unwrap().is_empty());
        assert!(list(store.as_ref(), "u3", "orders").await.unwrap().is_empty());
        assert!(!acting.read().await.index.contains("orders", "o1"));
    }

    #[tokio::test]
    async fn test_one_failure_does_not_roll_back_others() {
        let (store, _acting, updater) = setup();
        store.fail_writes_under(StorePath::profile("u3"), "rules");

        let err = updater.add("o1", &ids(&["u2", "u3"])).await.unwrap_err();
        match err {
            MirrorError::Aggregate(failure) => {
                assert_eq!(failure.attempted, 2);
                assert_eq!(failure.failed_targets(), vec!["u3"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(list(store.as_ref(), "u2", "orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_set_is_a_no_op() {
        let (store, _acting, updater) = setup();
        let report = updater.add("o1", &BTreeSet::new()).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.dump(), json!({}));
    }

    #[tokio::test]
    async fn test_apply_diff() {
        let (store, _acting, updater) = setup();
        updater.add("o1", &ids(&["u2"])).await.unwrap();

        let report = updater
            .apply_diff("o1", &ids(&["u3"]), &ids(&["u2"]))
            .await
            .unwrap();
        assert_eq!(report.action_for("u3"), Some(MembershipAction::Queued));
        assert_eq!(report.action_for("u2"), Some(MembershipAction::Withdrawn));
        assert!(list(store.as_ref(), "u2", "orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_updater_queues_everyone() {
        let store = Arc::new(MemoryStore::new());
        let updater = UsersMembershipUpdater::anonymous(store.clone(), "orders");

        let report = updater.add("o1", &ids(&["u1"])).await.unwrap();
        assert_eq!(report.action_for("u1"), Some(MembershipAction::Queued));
        assert_eq!(list(store.as_ref(), "u1", "orders").await.unwrap().len(), 1);
    }
}
