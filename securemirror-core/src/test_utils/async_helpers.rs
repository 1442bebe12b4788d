//! Async test helpers
//!
//! Mirrors publish from their own event-loop task, so tests observe them
//! through a recorder and wait with a bounded timeout.

use crate::core_mirror::{EventKind, MirrorEvent, SecureMirror, Snapshot};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};

/// Default bound for waiting on mirror activity
pub const WAIT: Duration = Duration::from_secs(2);

const ALL_KINDS: [EventKind; 7] = [
    EventKind::Change,
    EventKind::ChildAdded,
    EventKind::ChildRemoved,
    EventKind::ChildChanged,
    EventKind::ChildMoved,
    EventKind::Value,
    EventKind::Loaded,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutError {
    Elapsed,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Run a future with a timeout, returning Ok(result) or Err on timeout
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| TimeoutError::Elapsed)
}

/// Poll `check` until it holds, panicking after [`WAIT`]
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("condition not reached within {:?}: {}", WAIT, what);
    }
}

/// Poll the mirror's snapshot until `predicate` holds
pub async fn wait_for_snapshot<P>(mirror: &SecureMirror, what: &str, predicate: P)
where
    P: Fn(&Snapshot) -> bool,
{
    let predicate = &predicate;
    eventually(what, || async move { predicate(&mirror.snapshot().await) }).await;
}

/// Let spawned tasks run for a while
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
    sleep(Duration::from_millis(10)).await;
}

/// Captures every event a mirror publishes, in publication order
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<MirrorEvent>>>,
}

impl EventRecorder {
    /// Register on every event kind of `mirror`
    pub fn attach(mirror: &SecureMirror) -> Self {
        let recorder = EventRecorder::default();
        for kind in ALL_KINDS {
            let events = recorder.events.clone();
            mirror.on(kind, move |event| {
                if let Ok(mut events) = events.lock() {
                    events.push(event.clone());
                }
            });
        }
        recorder
    }

    pub fn events(&self) -> Vec<MirrorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(MirrorEvent::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    /// Wait until an event matching `predicate` has been recorded
    pub async fn wait_for<P>(&self, what: &str, predicate: P)
    where
        P: Fn(&MirrorEvent) -> bool,
    {
        eventually(what, || {
            let found = self.events().iter().any(&predicate);
            async move { found }
        })
        .await;
    }

    /// Wait for the value event that closes a transition
    pub async fn wait_for_value(&self) {
        self.wait_for("value event", |e| e.kind() == EventKind::Value)
            .await;
    }
}
