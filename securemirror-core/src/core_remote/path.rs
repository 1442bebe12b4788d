/*
    path.rs - Store paths and the persisted layout

    Layout:
    - /{typeName}/{recordId}                              record
    - /users/{principalId}/{typeName}/{recordId}          personal index flag
    - /users/{principalId}/dataQueue/{typeName}/{recordId} pending membership entry
    - /users/{principalId}/linked/{accountId}            account linked to the profile
    - /userAccounts/{accountId}                           profile id of a linked account
*/

use super::errors::{StoreError, StoreResult};
use std::fmt;

/// Root under which principal profiles, indexes and queues live
pub const USERS_ROOT: &str = "users";

/// Key of the pending membership queue inside a principal profile
pub const QUEUE_KEY: &str = "dataQueue";

/// Key of the role map inside a principal profile
pub const ROLES_KEY: &str = "roles";

/// Key of the linked-account map inside a principal profile
pub const LINKED_KEY: &str = "linked";

/// Root mapping authentication accounts to profile ids
pub const ACCOUNTS_ROOT: &str = "userAccounts";

/// Slash-separated address of a node in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorePath {
    segments: Vec<String>,
}

impl StorePath {
    /// The store root
    pub fn root() -> Self {
        StorePath::default()
    }

    /// Parse a path such as `orders/o1`; empty segments are ignored
    pub fn parse(raw: &str) -> StoreResult<Self> {
        let segments: Vec<String> = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.iter().any(|s| s.contains(['.', '#', '$', '[', ']'])) {
            return Err(StoreError::InvalidPath(raw.to_string()));
        }

        Ok(StorePath { segments })
    }

    /// Append one segment
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        StorePath { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(StorePath { segments })
    }

    /// Last segment, `None` for the root
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `other` or is one of its ancestors
    pub fn is_prefix_of(&self, other: &StorePath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// `/{typeName}`
    pub fn type_root(type_name: &str) -> Self {
        StorePath::root().child(type_name)
    }

    /// `/{typeName}/{recordId}`
    pub fn record(type_name: &str, record_id: &str) -> Self {
        StorePath::type_root(type_name).child(record_id)
    }

    /// `/users/{principalId}`
    pub fn profile(principal_id: &str) -> Self {
        StorePath::root().child(USERS_ROOT).child(principal_id)
    }

    /// `/users/{principalId}/{typeName}`
    pub fn user_index(principal_id: &str, type_name: &str) -> Self {
        StorePath::profile(principal_id).child(type_name)
    }

    /// `/userAccounts/{accountId}`
    pub fn account_link(account_id: &str) -> Self {
        StorePath::root().child(ACCOUNTS_ROOT).child(account_id)
    }

    /// `/users/{principalId}/dataQueue/{typeName}`
    pub fn user_queue(principal_id: &str, type_name: &str) -> Self {
        StorePath::profile(principal_id)
            .child(QUEUE_KEY)
            .child(type_name)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}
