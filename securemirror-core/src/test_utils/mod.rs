//! Test utilities shared by unit and integration tests
//!
//! Fixtures for stores, principals and mirrors, an event recorder, and
//! assertion helpers for event ordering.

pub mod assertions;
pub mod async_helpers;
pub mod fixtures;

pub use assertions::*;
pub use async_helpers::*;
pub use fixtures::*;
