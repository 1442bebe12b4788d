/*
    core_mirror - Permission-filtered live replicas

    - mirror: SecureMirror facade, lifecycle and writes
    - translator: per-mirror event loop turning store events into ordered
      mirror events
    - child: per-record state and subscription forwarding
    - events: event kinds and the typed handler bus
    - snapshot: immutable projections handed to consumers
*/

pub(crate) mod child;
pub mod errors;
pub mod events;
pub mod mirror;
pub mod snapshot;
pub(crate) mod translator;

pub use errors::{AggregateFailure, FailedTarget, MirrorError, MirrorResult};
pub use events::{EventBus, EventKind, Handler, HandlerToken, MirrorEvent};
pub use mirror::{MirrorContext, MirrorState, SecureMirror, WriteOutcome};
pub use snapshot::{MirrorRecord, Snapshot};
