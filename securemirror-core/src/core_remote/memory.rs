/*
    memory.rs - In-memory RemoteStore

    Reference adapter used by the test suite and the CLI. Holds one JSON tree
    and fans out change notifications to subscribers with the same push
    semantics a hosted store has:
    - a new subscription gets child_added for each existing child, then value
    - null or empty objects delete the node and prune empty parents
    - events for one subscription are delivered in commit order

    Transactions run their update function under the same lock as every
    other write, so a read-modify-write never interleaves with another one.

    Writes can be made to fail under a path prefix, and raw events can be
    injected to simulate reordered delivery.
*/

use super::errors::{StoreError, StoreResult};
use super::event::{ChangeKind, RemoteEvent, Subscription, SubscriptionId};
use super::path::StorePath;
use super::store::{RemoteStore, TransactionFn, TransactionResult, TransactionUpdate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

struct Subscriber {
    id: SubscriptionId,
    path: StorePath,
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

struct MemoryState {
    root: Value,
    subscribers: Vec<Subscriber>,
    failing: Vec<(StorePath, String)>,
}

/// JSON tree store with live subscriptions
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    next_subscription: AtomicU64,
    next_push: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::with_data(Value::Object(Map::new()))
    }

    /// Create a store seeded with `data` as its root
    pub fn with_data(data: Value) -> Self {
        let root = normalize(data).unwrap_or_else(|| Value::Object(Map::new()));
        MemoryStore {
            state: Mutex::new(MemoryState {
                root,
                subscribers: Vec::new(),
                failing: Vec::new(),
            }),
            next_subscription: AtomicU64::new(1),
            next_push: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every write at or below `prefix` fail with `reason`
    pub fn fail_writes_under(&self, prefix: StorePath, reason: impl Into<String>) {
        self.lock().failing.push((prefix, reason.into()));
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Deliver a raw event to every subscriber of exactly `path`
    pub fn inject(&self, path: &StorePath, event: RemoteEvent) {
        let state = self.lock();
        for sub in state.subscribers.iter().filter(|s| &s.path == path) {
            let _ = sub.tx.send(event.clone());
        }
    }

    /// Number of subscriptions whose receiver is still alive
    pub fn live_subscriptions(&self) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    /// Live subscriptions on exactly `path`
    pub fn live_subscriptions_on(&self, path: &StorePath) -> usize {
        self.lock()
            .subscribers
            .iter()
            .filter(|s| &s.path == path && !s.tx.is_closed())
            .count()
    }

    /// Copy of the whole tree
    pub fn dump(&self) -> Value {
        self.lock().root.clone()
    }

    fn mutate(&self, target: &StorePath, writes: Vec<(StorePath, Value)>) -> StoreResult<()> {
        self.mutate_with(target, |_| Some(writes)).map(|_| ())
    }

    /// Plan and apply writes under one lock; `plan` returning `None` aborts
    ///
    /// Returns whether the writes were applied and the value at `target`
    /// afterwards.
    fn mutate_with<F>(&self, target: &StorePath, plan: F) -> StoreResult<(bool, Option<Value>)>
    where
        F: FnOnce(Option<&Value>) -> Option<Vec<(StorePath, Value)>>,
    {
        let mut guard = self.lock();
        let MemoryState {
            root,
            subscribers,
            failing,
        } = &mut *guard;

        if let Some((_, reason)) = failing.iter().find(|(prefix, _)| prefix.is_prefix_of(target)) {
            return Err(StoreError::Rejected {
                path: target.to_string(),
                reason: reason.clone(),
            });
        }

        let Some(writes) = plan(lookup(&*root, target)) else {
            return Ok((false, lookup(&*root, target).cloned()));
        };

        let related: Vec<(usize, Option<Value>)> = subscribers
            .iter()
            .enumerate()
            .filter(|(_, s)| s.path.is_prefix_of(target) || target.is_prefix_of(&s.path))
            .map(|(i, s)| (i, lookup(&*root, &s.path).cloned()))
            .collect();

        for (path, value) in writes {
            write_at(root, path.segments(), value);
        }
        trace!(path = %target, "memory store write applied");

        let mut closed = Vec::new();
        for (index, old) in related {
            let sub = &subscribers[index];
            let new = lookup(root, &sub.path);
            if old.as_ref() == new {
                continue;
            }
            let key = sub.path.key().unwrap_or_default();
            for event in diff_events(key, old.as_ref(), new) {
                if sub.tx.send(event).is_err() {
                    closed.push(sub.id);
                    break;
                }
            }
        }

        if !closed.is_empty() {
            debug!(count = closed.len(), "pruning closed subscriptions");
            subscribers.retain(|s| !closed.contains(&s.id));
        }
        Ok((true, lookup(root, target).cloned()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn push_id(&self) -> String {
        let seq = self.next_push.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{:012x}{}", seq, &suffix[..8])
    }

    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        Ok(lookup(&self.lock().root, path).cloned())
    }

    async fn set(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        self.mutate(path, vec![(path.clone(), value)])
    }

    async fn update(&self, path: &StorePath, fields: Map<String, Value>) -> StoreResult<()> {
        let writes = fields
            .into_iter()
            .map(|(key, value)| (path.child(key), value))
            .collect();
        self.mutate(path, writes)
    }

    async fn remove(&self, path: &StorePath) -> StoreResult<()> {
        self.mutate(path, vec![(path.clone(), Value::Null)])
    }

    async fn transaction(
        &self,
        path: &StorePath,
        update: TransactionFn<'_>,
    ) -> StoreResult<TransactionResult> {
        let (committed, value) = self.mutate_with(path, |current| match update(current) {
            TransactionUpdate::Abort => None,
            TransactionUpdate::Set(value) => Some(vec![(path.clone(), value)]),
        })?;
        trace!(%path, committed, "transaction finished");
        Ok(TransactionResult { committed, value })
    }

    async fn on(&self, path: &StorePath) -> StoreResult<Subscription> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let current = lookup(&state.root, path).cloned();
        let key = path.key().unwrap_or_default();
        for event in diff_events(key, None, current.as_ref()) {
            let _ = tx.send(event);
        }
        state.subscribers.push(Subscriber {
            id,
            path: path.clone(),
            tx,
        });
        debug!(%path, %id, "subscription opened");

        Ok(Subscription::new(id, path.clone(), rx))
    }

    async fn off(&self, id: SubscriptionId) {
        self.lock().subscribers.retain(|s| s.id != id);
        debug!(%id, "subscription released");
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drop nulls and empty objects, recursively
fn normalize(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        other => Some(other),
    }
}

fn lookup<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.get(segment)?;
    }
    if is_empty(node) {
        None
    } else {
        Some(node)
    }
}

fn write_at(node: &mut Value, segments: &[String], value: Value) {
    match normalize(value) {
        Some(value) => insert_at(node, segments, value),
        None => delete_at(node, segments),
    }
}

fn insert_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        if rest.is_empty() {
            map.insert(first.clone(), value);
        } else {
            let child = map
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            insert_at(child, rest, value);
        }
    }
}

fn delete_at(node: &mut Value, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        *node = Value::Object(Map::new());
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(first);
        return;
    }
    let prune = match map.get_mut(first) {
        Some(child) => {
            delete_at(child, rest);
            is_empty(child)
        }
        None => false,
    };
    if prune {
        map.remove(first);
    }
}

/// Child events followed by one value event, for a node going `old` -> `new`
fn diff_events(key: &str, old: Option<&Value>, new: Option<&Value>) -> Vec<RemoteEvent> {
    let empty = Map::new();
    let old_children = old.and_then(Value::as_object).unwrap_or(&empty);
    let new_children = new.and_then(Value::as_object).unwrap_or(&empty);

    let mut events = Vec::new();
    for (child_key, value) in old_children {
        if !new_children.contains_key(child_key) {
            events.push(RemoteEvent::new(
                ChangeKind::ChildRemoved,
                child_key.clone(),
                Some(value.clone()),
            ));
        }
    }

    let mut prev_key: Option<String> = None;
    for (child_key, value) in new_children {
        match old_children.get(child_key) {
            None => events.push(
                RemoteEvent::new(ChangeKind::ChildAdded, child_key.clone(), Some(value.clone()))
                    .with_prev_key(prev_key.clone()),
            ),
            Some(previous) if previous != value => events.push(RemoteEvent::new(
                ChangeKind::ChildChanged,
                child_key.clone(),
                Some(value.clone()),
            )),
            Some(_) => {}
        }
        prev_key = Some(child_key.clone());
    }

    events.push(RemoteEvent::new(ChangeKind::Value, key, new.cloned()));
    events
}
