//! Mirror events and the typed publish-subscribe channel
//!
//! Every transition of one child is published as a triple:
//! `Change`, then the specific child event, then (once nothing is still
//! loading) a `Value` carrying the full snapshot. Bulk loads end with one
//! `Value` immediately followed by `Loaded`.

use super::snapshot::{MirrorRecord, Snapshot};
use crate::metrics;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

/// Kinds of events a mirror publishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    ChildAdded,
    ChildRemoved,
    ChildChanged,
    ChildMoved,
    Value,
    Loaded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Change => "change",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildRemoved => "child_removed",
            EventKind::ChildChanged => "child_changed",
            EventKind::ChildMoved => "child_moved",
            EventKind::Value => "value",
            EventKind::Loaded => "loaded",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A filtered, ordered event published by a mirror
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorEvent {
    /// A transition for `id` is about to be published
    Change { id: String },
    ChildAdded {
        record: MirrorRecord,
        prev_id: Option<String>,
    },
    ChildRemoved { record: MirrorRecord },
    ChildChanged { record: MirrorRecord },
    ChildMoved {
        record: MirrorRecord,
        prev_id: Option<String>,
    },
    Value(Snapshot),
    Loaded(Snapshot),
}

impl MirrorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MirrorEvent::Change { .. } => EventKind::Change,
            MirrorEvent::ChildAdded { .. } => EventKind::ChildAdded,
            MirrorEvent::ChildRemoved { .. } => EventKind::ChildRemoved,
            MirrorEvent::ChildChanged { .. } => EventKind::ChildChanged,
            MirrorEvent::ChildMoved { .. } => EventKind::ChildMoved,
            MirrorEvent::Value(_) => EventKind::Value,
            MirrorEvent::Loaded(_) => EventKind::Loaded,
        }
    }

    /// Record the event is about, `None` for snapshot events
    pub fn record_id(&self) -> Option<&str> {
        match self {
            MirrorEvent::Change { id } => Some(id),
            MirrorEvent::ChildAdded { record, .. }
            | MirrorEvent::ChildRemoved { record }
            | MirrorEvent::ChildChanged { record }
            | MirrorEvent::ChildMoved { record, .. } => Some(&record.id),
            MirrorEvent::Value(_) | MirrorEvent::Loaded(_) => None,
        }
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            MirrorEvent::Value(snapshot) | MirrorEvent::Loaded(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

/// Callback registered for one event kind
pub type Handler = Arc<dyn Fn(&MirrorEvent) + Send + Sync>;

/// Token returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken {
    kind: EventKind,
    id: u64,
}

impl HandlerToken {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// Per-kind handler registry plus a broadcast stream of every event
///
/// Handlers run synchronously, in registration order, on the task that
/// publishes. The broadcast stream sees the same order.
pub struct EventBus {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<MirrorEvent>,
}

impl EventBus {
    /// Create a bus whose broadcast stream buffers `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        EventBus {
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<(u64, Handler)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(&self, kind: EventKind, handler: Handler) -> HandlerToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry().entry(kind).or_default().push((id, handler));
        HandlerToken { kind, id }
    }

    /// Remove a handler; false if the token was already released
    pub fn off(&self, token: HandlerToken) -> bool {
        let mut registry = self.registry();
        let Some(list) = registry.get_mut(&token.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != token.id);
        before != list.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MirrorEvent> {
        self.tx.subscribe()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Drop every handler
    pub fn clear(&self) {
        self.registry().clear();
    }

    /// Publish to handlers of the event's kind, then to stream subscribers
    pub fn emit(&self, event: MirrorEvent) {
        let handlers: Vec<Handler> = self
            .registry()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(&event);
        }

        metrics::record_counter(metrics::EVENTS_EMITTED, 1);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(id: &str) -> MirrorEvent {
        MirrorEvent::Change { id: id.to_string() }
    }

    #[test]
    fn test_handlers_by_kind_in_registration_order() {
        let bus = EventBus::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.on(
                EventKind::Change,
                Arc::new(move |event| {
                    seen.lock()
                        .unwrap()
                        .push(format!("{}:{}", tag, event.record_id().unwrap()))
                }),
            );
        }
        let other = seen.clone();
        bus.on(
            EventKind::Value,
            Arc::new(move |_| other.lock().unwrap().push("value".to_string())),
        );

        bus.emit(change("o1"));
        assert_eq!(*seen.lock().unwrap(), vec!["first:o1", "second:o1"]);
    }

    #[test]
    fn test_off_releases_handler() {
        let bus = EventBus::new(8);
        let token = bus.on(EventKind::Change, Arc::new(|_| {}));
        assert_eq!(bus.handler_count(EventKind::Change), 1);

        assert!(bus.off(token));
        assert!(!bus.off(token));
        assert_eq!(bus.handler_count(EventKind::Change), 0);
    }

    #[tokio::test]
    async fn test_stream_subscribers_receive_every_kind() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(change("o1"));
        bus.emit(MirrorEvent::Value(Snapshot::empty("orders")));

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Change);
        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Value);
    }

    #[test]
    fn test_event_accessors() {
        let record = MirrorRecord::new("o1", serde_json::json!({}));
        let added = MirrorEvent::ChildAdded {
            record,
            prev_id: None,
        };
        assert_eq!(added.kind(), EventKind::ChildAdded);
        assert_eq!(added.record_id(), Some("o1"));
        assert!(added.snapshot().is_none());

        let loaded = MirrorEvent::Loaded(Snapshot::empty("orders"));
        assert_eq!(loaded.record_id(), None);
        assert!(loaded.snapshot().unwrap().is_empty());
    }
}
