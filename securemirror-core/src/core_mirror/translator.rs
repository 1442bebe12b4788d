/*
    translator.rs - Mirror event loop

    Every store subscription of one mirror (type root or personal index,
    each materialized record, the pending queue) is forwarded into a single
    inbox. This loop drains it one message at a time, so the local state
    mutation and the event triple of one transition never interleave with
    another's.

    Membership sources:
    - root mode: the type root `/{type}` lists every record
    - index mode: the personal index `/users/{pid}/{type}` lists the records
      the principal may see without blanket access

    Record values and removals always come from the record's own
    subscription, which is commit-ordered for that path. The type root only
    tells the loop which ids to subscribe to, so a stale child_added or
    child_removed from it cannot override a later committed value.

    Value synthesis is a counting join: a `value` is owed after each
    transition and published only once no materialized child is still
    waiting for its first load. During a bulk load the owed value is folded
    into the single value + loaded pair that ends it.
*/

use super::child::{forward, ChildState};
use super::events::MirrorEvent;
use super::mirror::{MirrorInner, MirrorState};
use super::snapshot::MirrorRecord;
use crate::core_membership::PendingQueueEntry;
use crate::core_mirror::errors::FailedTarget;
use crate::core_policy::is_truthy;
use crate::core_remote::{ChangeKind, RemoteEvent, StorePath};
use crate::metrics;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Which subscription a remote event came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Source {
    Root,
    Index,
    Child(String),
    Queue,
}

#[derive(Debug)]
pub(crate) enum Command {
    /// Materialize every indexed record and finish with value + loaded
    LoadForUser { reply: Option<oneshot::Sender<()>> },
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Inbound {
    Remote { source: Source, event: RemoteEvent },
    Command(Command),
}

/// How the mirror learns which records exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindMode {
    Root,
    Index,
}

pub(crate) struct EventTranslator {
    mirror: Weak<MirrorInner>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    mode: BindMode,
    /// Materialized children still waiting for their first value
    pending: BTreeSet<String>,
    bulk_loading: bool,
    root_synced: bool,
    value_owed: bool,
    load_started: bool,
}

impl EventTranslator {
    pub(crate) fn new(
        mirror: Weak<MirrorInner>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        mode: BindMode,
    ) -> Self {
        EventTranslator {
            mirror,
            inbox,
            mode,
            pending: BTreeSet::new(),
            // The root's initial sync is a bulk load of its own.
            bulk_loading: mode == BindMode::Root,
            root_synced: false,
            value_owed: false,
            load_started: false,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(message) = self.inbox.recv().await {
            let Some(inner) = self.mirror.upgrade() else {
                break;
            };
            if inner.is_torn_down() {
                break;
            }

            match message {
                Inbound::Command(Command::Shutdown) => break,
                Inbound::Command(Command::LoadForUser { reply }) => {
                    self.load_for_user(&inner, reply).await
                }
                Inbound::Remote { source, event } => match source {
                    Source::Root => self.on_root(&inner, event).await,
                    Source::Index => self.on_index(&inner, event).await,
                    Source::Child(id) => self.on_child(&inner, id, event).await,
                    Source::Queue => self.on_queue(&inner, event).await,
                },
            }
        }
        debug!("mirror event loop stopped");
    }

    async fn load_for_user(&mut self, inner: &Arc<MirrorInner>, reply: Option<oneshot::Sender<()>>) {
        if self.load_started || self.mode == BindMode::Root {
            debug!(type_name = %inner.type_name, "no load for user needed");
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }
        self.load_started = true;
        self.bulk_loading = true;

        let ids = match &inner.principal {
            Some(principal) => principal.indexed_ids(&inner.type_name).await,
            None => Vec::new(),
        };
        debug!(type_name = %inner.type_name, count = ids.len(), "loading indexed records");
        for id in ids {
            self.materialize(inner, &id, None, None).await;
        }

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        self.settle(inner).await;
    }

    async fn on_root(&mut self, inner: &Arc<MirrorInner>, event: RemoteEvent) {
        match event.kind {
            ChangeKind::ChildAdded => {
                self.materialize(inner, &event.key, event.value.as_ref(), event.prev_key)
                    .await;
                self.settle(inner).await;
            }
            ChangeKind::ChildChanged => {
                if !inner.is_tracked(&event.key).await {
                    self.materialize(inner, &event.key, event.value.as_ref(), None)
                        .await;
                    self.settle(inner).await;
                }
            }
            // The record's own subscription reports the removal, in commit
            // order with its other values.
            ChangeKind::ChildRemoved => {
                debug!(id = %event.key, "type root reported removal");
            }
            ChangeKind::ChildMoved => self.moved(inner, &event.key, event.prev_key).await,
            ChangeKind::Value => {
                self.root_synced = true;
                self.settle(inner).await;
            }
        }
    }

    async fn on_index(&mut self, inner: &Arc<MirrorInner>, event: RemoteEvent) {
        let present = match event.kind {
            ChangeKind::ChildAdded | ChangeKind::ChildChanged => {
                event.value.as_ref().map(is_truthy).unwrap_or(false)
            }
            ChangeKind::ChildRemoved => false,
            // The index is a flag map with no sibling order to report.
            ChangeKind::ChildMoved | ChangeKind::Value => return,
        };

        if let Some(principal) = &inner.principal {
            principal
                .set_index_flag(&inner.type_name, &event.key, present)
                .await;
        }

        if present {
            self.materialize(inner, &event.key, None, None).await;
        } else {
            self.drop_child(inner, &event.key).await;
        }
        self.settle(inner).await;
    }

    async fn on_child(&mut self, inner: &Arc<MirrorInner>, id: String, event: RemoteEvent) {
        // Field-level events of the record are covered by its value event.
        if event.kind != ChangeKind::Value {
            return;
        }

        let (first_load, previous, published) = {
            let mut shared = inner.shared.write().await;
            let Some(child) = shared.children.get_mut(&id) else {
                return;
            };
            let first_load = !child.loaded;
            let previous = child.value.take();
            child.loaded = true;
            child.value = event.value.clone();
            (first_load, previous, child.published)
        };

        if first_load {
            self.pending.remove(&id);
            match event.value {
                Some(value) => {
                    if inner.permits(&id, Some(&value)).await {
                        let prev_id = inner.prev_id_of(&id).await;
                        self.transition(
                            inner,
                            &id,
                            MirrorEvent::ChildAdded {
                                record: MirrorRecord::new(id.clone(), value),
                                prev_id,
                            },
                        )
                        .await;
                    } else {
                        metrics::record_counter(metrics::READS_FILTERED, 1);
                    }
                }
                None if self.mode == BindMode::Root => {
                    debug!(id = %id, "listed record has no value, dropping");
                    self.release(inner, &id).await;
                }
                // Indexed but missing: tracked as absent until it appears.
                None => {}
            }
            self.settle(inner).await;
            return;
        }

        match event.value {
            None => {
                if self.mode == BindMode::Root {
                    self.release(inner, &id).await;
                }
                if let (true, Some(old)) = (published, previous) {
                    self.transition(
                        inner,
                        &id,
                        MirrorEvent::ChildRemoved {
                            record: MirrorRecord::new(id.clone(), old),
                        },
                    )
                    .await;
                }
            }
            Some(new) if previous.as_ref() != Some(&new) => {
                if previous.is_some() {
                    // One cooperative tick before snapshotting the change.
                    tokio::task::yield_now().await;
                    if inner.is_torn_down() {
                        return;
                    }
                }
                if inner.permits(&id, Some(&new)).await {
                    let record = MirrorRecord::new(id.clone(), new);
                    let specific = if published {
                        MirrorEvent::ChildChanged { record }
                    } else {
                        MirrorEvent::ChildAdded {
                            record,
                            prev_id: None,
                        }
                    };
                    self.transition(inner, &id, specific).await;
                } else if published {
                    // No longer visible: report it leaving the view.
                    let record = MirrorRecord::new(id.clone(), previous.unwrap_or(new));
                    self.transition(inner, &id, MirrorEvent::ChildRemoved { record })
                        .await;
                }
            }
            Some(_) => {}
        }
        self.settle(inner).await;
    }

    async fn on_queue(&mut self, inner: &Arc<MirrorInner>, event: RemoteEvent) {
        // The initial burst is handled like live entries: anything still
        // queued at subscribe time arrived after the drain listed the queue.
        if !matches!(event.kind, ChangeKind::ChildAdded | ChangeKind::ChildChanged) {
            return;
        }
        let (Some(reconciler), Some(value)) = (&inner.reconciler, event.value) else {
            return;
        };
        // Failed entries wait for the next open instead of looping here.
        if inner.has_failed_target(&event.key).await {
            debug!(record_id = %event.key, "skipping previously failed queue entry");
            return;
        }
        let entry = PendingQueueEntry::new(
            reconciler.principal_id(),
            &inner.type_name,
            &event.key,
            is_truthy(&value),
        );
        match reconciler.apply(&entry).await {
            Ok(true) => metrics::record_counter(metrics::QUEUE_APPLIED, 1),
            Ok(false) => {}
            Err(e) => {
                metrics::record_counter(metrics::QUEUE_FAILED, 1);
                warn!(
                    type_name = %inner.type_name,
                    record_id = %entry.record_id,
                    error = %e,
                    "queued membership entry failed"
                );
                inner
                    .record_reconcile_failure(FailedTarget {
                        target: entry.record_id.clone(),
                        cause: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Subscribe to one record, at most once while it is tracked
    async fn materialize(
        &mut self,
        inner: &Arc<MirrorInner>,
        id: &str,
        hint: Option<&Value>,
        prev_id: Option<String>,
    ) {
        if inner.is_tracked(id).await {
            return;
        }
        if !inner.permits(id, hint).await {
            metrics::record_counter(metrics::READS_FILTERED, 1);
            debug!(type_name = %inner.type_name, id, "child filtered");
            return;
        }

        let path = StorePath::record(&inner.type_name, id);
        let subscription = match inner.store.on(&path).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(%path, error = %e, "child subscription failed");
                return;
            }
        };
        if inner.is_torn_down() {
            inner.store.off(subscription.id()).await;
            return;
        }

        let guard = forward(subscription, Source::Child(id.to_string()), inner.inbox.clone());
        let tracked = {
            let mut shared = inner.shared.write().await;
            shared.children.insert(
                id.to_string(),
                ChildState::new(&inner.type_name, id, prev_id, guard),
            );
            shared.children.len()
        };
        self.pending.insert(id.to_string());
        metrics::record_gauge(metrics::CHILDREN_TRACKED, tracked as f64);
        debug!(type_name = %inner.type_name, id, "child materialized");
    }

    /// Stop tracking `id`, publishing its removal if it was visible
    ///
    /// Local state is released before `child_removed` goes out, so handlers
    /// of that event already see the record gone from the snapshot.
    async fn drop_child(&mut self, inner: &Arc<MirrorInner>, id: &str) {
        let Some(child) = self.release(inner, id).await else {
            return;
        };
        let (true, Some(value)) = (child.published, child.value) else {
            return;
        };
        self.transition(
            inner,
            id,
            MirrorEvent::ChildRemoved {
                record: MirrorRecord::new(id, value),
            },
        )
        .await;
    }

    /// Remove local state and release the record's subscription
    async fn release(&mut self, inner: &Arc<MirrorInner>, id: &str) -> Option<ChildState> {
        let (child, tracked) = {
            let mut shared = inner.shared.write().await;
            let child = shared.children.remove(id)?;
            (child, shared.children.len())
        };
        self.pending.remove(id);
        inner.store.off(child.guard.id()).await;
        metrics::record_gauge(metrics::CHILDREN_TRACKED, tracked as f64);
        debug!(path = %child.path(), "child released");
        Some(child)
    }

    async fn moved(&mut self, inner: &Arc<MirrorInner>, id: &str, prev_id: Option<String>) {
        let value = {
            let shared = inner.shared.read().await;
            shared
                .children
                .get(id)
                .filter(|child| child.published)
                .and_then(|child| child.visible_value().cloned())
        };
        let Some(value) = value else {
            return;
        };
        if inner.permits(id, Some(&value)).await {
            self.transition(
                inner,
                id,
                MirrorEvent::ChildMoved {
                    record: MirrorRecord::new(id, value),
                    prev_id,
                },
            )
            .await;
            self.settle(inner).await;
        }
    }

    /// Publish `change` then `specific`; the trailing value is owed
    async fn transition(&mut self, inner: &Arc<MirrorInner>, id: &str, specific: MirrorEvent) {
        if inner.is_torn_down() {
            return;
        }
        debug!(type_name = %inner.type_name, id, kind = %specific.kind(), "transition");
        let in_view = !matches!(specific, MirrorEvent::ChildRemoved { .. });
        if let Some(child) = inner.shared.write().await.children.get_mut(id) {
            child.published = in_view;
        }
        inner.bus.emit(MirrorEvent::Change { id: id.to_string() });
        inner.bus.emit(specific);
        self.value_owed = true;
    }

    /// Publish whatever the counting join allows right now
    async fn settle(&mut self, inner: &Arc<MirrorInner>) {
        if self.bulk_loading {
            self.complete_load(inner).await;
        } else {
            self.flush(inner).await;
        }
    }

    async fn flush(&mut self, inner: &Arc<MirrorInner>) {
        if !self.value_owed || !self.pending.is_empty() {
            return;
        }
        self.value_owed = false;
        let snapshot = inner.snapshot().await;
        if inner.is_torn_down() {
            return;
        }
        inner.bus.emit(MirrorEvent::Value(snapshot));
    }

    async fn complete_load(&mut self, inner: &Arc<MirrorInner>) {
        if !self.pending.is_empty() {
            return;
        }
        match self.mode {
            BindMode::Root if !self.root_synced => return,
            BindMode::Index if !self.load_started => return,
            _ => {}
        }

        self.bulk_loading = false;
        self.value_owed = false;
        let snapshot = inner.snapshot().await;
        if inner.is_torn_down() {
            return;
        }
        let count = snapshot.len();
        inner.bus.emit(MirrorEvent::Value(snapshot.clone()));
        inner.bus.emit(MirrorEvent::Loaded(snapshot));

        if self.mode == BindMode::Index {
            inner.shared.write().await.state = MirrorState::Ready;
        }
        inner.signal_loaded();
        info!(type_name = %inner.type_name, records = count, "mirror loaded");
    }
}
