//! Raw change notifications delivered by the remote store

use super::path::StorePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// The five canonical change kinds a store subscription reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Value,
    ChildAdded,
    ChildRemoved,
    ChildChanged,
    ChildMoved,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Value => "value",
            ChangeKind::ChildAdded => "child_added",
            ChangeKind::ChildRemoved => "child_removed",
            ChangeKind::ChildChanged => "child_changed",
            ChangeKind::ChildMoved => "child_moved",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification from a subscription
///
/// For child kinds `key` names the child; for [`ChangeKind::Value`] it is the
/// key of the subscribed node itself. `value` is `None` when the node is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub kind: ChangeKind,
    pub key: String,
    pub value: Option<Value>,
    pub prev_key: Option<String>,
}

impl RemoteEvent {
    pub fn new(kind: ChangeKind, key: impl Into<String>, value: Option<Value>) -> Self {
        RemoteEvent {
            kind,
            key: key.into(),
            value,
            prev_key: None,
        }
    }

    pub fn with_prev_key(mut self, prev_key: Option<String>) -> Self {
        self.prev_key = prev_key;
        self
    }
}

/// Identifier handed back by `on`, used to release the subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A live subscription on one path
///
/// Events arrive in commit order for this path. Dropping the subscription
/// stops delivery; stores prune closed receivers on their next send.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    path: StorePath,
    events: mpsc::UnboundedReceiver<RemoteEvent>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        path: StorePath,
        events: mpsc::UnboundedReceiver<RemoteEvent>,
    ) -> Self {
        Subscription { id, path, events }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Next event, `None` once the store side is gone
    pub async fn next(&mut self) -> Option<RemoteEvent> {
        self.events.recv().await
    }

    /// Non-blocking poll, used by tests to assert on queued events
    pub fn try_next(&mut self) -> Option<RemoteEvent> {
        self.events.try_recv().ok()
    }
}
