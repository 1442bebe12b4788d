//! Per-record child state and subscription forwarding

use super::translator::{Inbound, Source};
use crate::core_remote::{StorePath, Subscription, SubscriptionId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle to a forwarding task for one store subscription
///
/// Dropping the guard aborts the task, which drops the subscription
/// receiver. Callers still release the store side with `off`.
#[derive(Debug)]
pub(crate) struct SubscriptionGuard {
    id: SubscriptionId,
    task: JoinHandle<()>,
}

impl SubscriptionGuard {
    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pipe every event of `subscription` into the mirror inbox, tagged by source
pub(crate) fn forward(
    mut subscription: Subscription,
    source: Source,
    inbox: mpsc::UnboundedSender<Inbound>,
) -> SubscriptionGuard {
    let id = subscription.id();
    let task = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            trace!(%id, kind = %event.kind, key = %event.key, "forwarding remote event");
            let message = Inbound::Remote {
                source: source.clone(),
                event,
            };
            if inbox.send(message).is_err() {
                break;
            }
        }
    });
    SubscriptionGuard { id, task }
}

/// One materialized record
///
/// Holds the owning type name, never a reference to the mirror itself.
#[derive(Debug)]
pub(crate) struct ChildState {
    pub(crate) type_name: String,
    pub(crate) id: String,
    /// Last value delivered by the record's own subscription
    pub(crate) value: Option<Value>,
    /// Set once the first value event of the record has arrived
    pub(crate) loaded: bool,
    /// Predecessor reported by the type root when the child was added
    pub(crate) prev_id: Option<String>,
    /// Consumers were last told the record is in view
    pub(crate) published: bool,
    pub(crate) guard: SubscriptionGuard,
}

impl ChildState {
    pub(crate) fn new(
        type_name: &str,
        id: &str,
        prev_id: Option<String>,
        guard: SubscriptionGuard,
    ) -> Self {
        ChildState {
            type_name: type_name.to_string(),
            id: id.to_string(),
            value: None,
            loaded: false,
            prev_id,
            published: false,
            guard,
        }
    }

    pub(crate) fn path(&self) -> StorePath {
        StorePath::record(&self.type_name, &self.id)
    }

    /// Loaded and present in the store
    pub(crate) fn visible_value(&self) -> Option<&Value> {
        if self.loaded {
            self.value.as_ref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_remote::{MemoryStore, RemoteStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_forward_tags_events_with_source() {
        let store = MemoryStore::with_data(json!({ "orders": { "o1": { "n": 1 } } }));
        let sub = store.on(&StorePath::record("orders", "o1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _guard = forward(sub, Source::Child("o1".to_string()), tx);

        // Field-level child_added first, then the record value.
        let mut last = None;
        for _ in 0..2 {
            last = rx.recv().await;
        }
        match last {
            Some(Inbound::Remote { source, event }) => {
                assert_eq!(source, Source::Child("o1".to_string()));
                assert_eq!(event.value, Some(json!({ "n": 1 })));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropping_guard_closes_subscription() {
        let store = MemoryStore::new();
        let path = StorePath::record("orders", "o1");
        let sub = store.on(&path).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let guard = forward(sub, Source::Child("o1".to_string()), tx);
        drop(guard);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(store.live_subscriptions_on(&path), 0);
    }
}
