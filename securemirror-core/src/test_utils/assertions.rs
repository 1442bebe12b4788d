//! Assertions over recorded mirror events

use crate::core_mirror::{EventKind, MirrorEvent};
use std::fmt::Debug;

/// Assert that a Result is Ok and return the value
pub fn assert_ok<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("Expected Ok, got Err: {:?}", e),
    }
}

/// Assert that a Result is Err and return the error
pub fn assert_err<T: Debug, E>(result: Result<T, E>) -> E {
    match result {
        Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
        Err(e) => e,
    }
}

/// Assert that every child event is immediately preceded by the `change`
/// for the same record, and that no `value` interrupts a pair
pub fn assert_transitions_well_formed(events: &[MirrorEvent]) {
    for (i, event) in events.iter().enumerate() {
        let kind = event.kind();
        if matches!(kind, EventKind::Change) {
            let next = events.get(i + 1).unwrap_or_else(|| {
                panic!("change at {} is not followed by a child event: {:?}", i, events)
            });
            assert!(
                matches!(
                    next.kind(),
                    EventKind::ChildAdded
                        | EventKind::ChildRemoved
                        | EventKind::ChildChanged
                        | EventKind::ChildMoved
                ),
                "change at {} followed by {:?}",
                i,
                next.kind()
            );
            assert_eq!(
                event.record_id(),
                next.record_id(),
                "change and child event disagree on the record"
            );
        } else if event.record_id().is_some() {
            let previous = i.checked_sub(1).and_then(|p| events.get(p));
            assert!(
                matches!(previous.map(MirrorEvent::kind), Some(EventKind::Change)),
                "{:?} at {} is not preceded by change",
                kind,
                i
            );
        }
    }
}

/// Assert the exact kind sequence of recorded events
pub fn assert_kinds(events: &[MirrorEvent], expected: &[EventKind]) {
    let kinds: Vec<EventKind> = events.iter().map(MirrorEvent::kind).collect();
    assert_eq!(kinds, expected, "unexpected event sequence: {:?}", events);
}
