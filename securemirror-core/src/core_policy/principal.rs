//! Principals, their roles and personal indexes

use super::record::is_truthy;
use crate::core_remote::{LINKED_KEY, QUEUE_KEY, ROLES_KEY};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};

/// Per-type sets of record ids a principal knows without blanket access
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonalIndex {
    types: HashMap<String, BTreeMap<String, bool>>,
}

impl PersonalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, type_name: &str, record_id: &str) -> bool {
        self.types
            .get(type_name)
            .and_then(|ids| ids.get(record_id))
            .copied()
            .unwrap_or(false)
    }

    /// Set or clear one flag; clearing removes the entry
    pub fn set(&mut self, type_name: &str, record_id: &str, present: bool) {
        if present {
            self.types
                .entry(type_name.to_string())
                .or_default()
                .insert(record_id.to_string(), true);
        } else if let Some(ids) = self.types.get_mut(type_name) {
            ids.remove(record_id);
            if ids.is_empty() {
                self.types.remove(type_name);
            }
        }
    }

    /// Ids with a truthy flag, in key order
    pub fn ids(&self, type_name: &str) -> Vec<String> {
        self.types
            .get(type_name)
            .map(|ids| {
                ids.iter()
                    .filter(|(_, present)| **present)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace a whole type's entries from a stored `{id: flag}` map
    pub fn replace_type(&mut self, type_name: &str, stored: Option<&Value>) {
        let ids: BTreeMap<String, bool> = stored
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter(|(_, flag)| is_truthy(flag))
                    .map(|(id, _)| (id.clone(), true))
                    .collect()
            })
            .unwrap_or_default();
        if ids.is_empty() {
            self.types.remove(type_name);
        } else {
            self.types.insert(type_name.to_string(), ids);
        }
    }
}

/// An acting principal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub roles: HashMap<String, bool>,
    pub index: PersonalIndex,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Principal {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into(), true);
        self
    }

    pub fn with_indexed(mut self, type_name: &str, record_id: &str) -> Self {
        self.index.set(type_name, record_id, true);
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.get(role).copied().unwrap_or(false)
    }

    /// Build from a stored profile `{roles: {..}, <type>: {id: flag}, dataQueue: {..}}`
    pub fn from_profile(id: impl Into<String>, profile: Option<&Value>) -> Self {
        let mut principal = Principal::new(id);
        let Some(fields) = profile.and_then(Value::as_object) else {
            return principal;
        };

        for (key, value) in fields {
            match key.as_str() {
                ROLES_KEY => {
                    if let Some(roles) = value.as_object() {
                        principal.roles = roles
                            .iter()
                            .map(|(role, flag)| (role.clone(), is_truthy(flag)))
                            .collect();
                    }
                }
                QUEUE_KEY | LINKED_KEY => {}
                type_name if value.is_object() => {
                    principal.index.replace_type(type_name, Some(value));
                }
                _ => {}
            }
        }
        principal
    }

    /// Stored profile for a fresh principal
    pub fn to_profile(&self) -> Value {
        let mut profile = Map::new();
        let roles: Map<String, Value> = self
            .roles
            .iter()
            .filter(|(_, flag)| **flag)
            .map(|(role, _)| (role.clone(), Value::Bool(true)))
            .collect();
        if !roles.is_empty() {
            profile.insert(ROLES_KEY.to_string(), Value::Object(roles));
        }
        for (type_name, ids) in &self.index.types {
            let flags: Map<String, Value> = ids
                .keys()
                .map(|id| (id.clone(), Value::Bool(true)))
                .collect();
            profile.insert(type_name.clone(), Value::Object(flags));
        }
        // An otherwise empty profile still needs a node to exist.
        profile.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(profile)
    }
}

/// Principal state shared by every mirror of one session
///
/// The personal index is updated from two sides: direct writes by the
/// membership updater and index subscriptions of open mirrors.
#[derive(Debug)]
pub struct PrincipalContext {
    id: String,
    state: RwLock<Principal>,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Arc<Self> {
        Arc::new(PrincipalContext {
            id: principal.id.clone(),
            state: RwLock::new(principal),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Principal> {
        self.state.read().await
    }

    pub async fn snapshot(&self) -> Principal {
        self.state.read().await.clone()
    }

    pub async fn set_index_flag(&self, type_name: &str, record_id: &str, present: bool) {
        self.state
            .write()
            .await
            .index
            .set(type_name, record_id, present);
    }

    pub async fn indexed_ids(&self, type_name: &str) -> Vec<String> {
        self.state.read().await.index.ids(type_name)
    }

    pub async fn set_role(&self, role: &str, granted: bool) {
        self.state
            .write()
            .await
            .roles
            .insert(role.to_string(), granted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_index_set_and_clear() {
        let mut index = PersonalIndex::new();
        index.set("orders", "o1", true);
        index.set("orders", "o2", true);
        assert!(index.contains("orders", "o1"));
        assert_eq!(index.ids("orders"), vec!["o1", "o2"]);

        index.set("orders", "o1", false);
        index.set("orders", "o2", false);
        assert!(!index.contains("orders", "o1"));
        assert!(index.ids("orders").is_empty());
    }

    #[test]
    fn test_from_profile() {
        let profile = json!({
            "roles": { "admin": true, "auditor": false },
            "orders": { "o5": true, "o6": false },
            "dataQueue": { "orders": { "o7": true } },
            "id": "u1"
        });
        let principal = Principal::from_profile("u1", Some(&profile));
        assert!(principal.has_role("admin"));
        assert!(!principal.has_role("auditor"));
        assert!(principal.index.contains("orders", "o5"));
        assert!(!principal.index.contains("orders", "o6"));
        assert!(!principal.index.contains("dataQueue", "orders"));
        assert!(!principal.index.contains("orders", "o7"));
    }

    #[test]
    fn test_profile_round_trip() {
        let principal = Principal::new("u1")
            .with_role("admin")
            .with_indexed("orders", "o1");
        let restored = Principal::from_profile("u1", Some(&principal.to_profile()));
        assert_eq!(restored, principal);
    }

    #[tokio::test]
    async fn test_context_updates_are_shared() {
        let ctx = PrincipalContext::new(Principal::new("u1"));
        let other = Arc::clone(&ctx);

        ctx.set_index_flag("orders", "o1", true).await;
        assert_eq!(other.indexed_ids("orders").await, vec!["o1"]);

        other.set_role("admin", true).await;
        assert!(ctx.read().await.has_role("admin"));
    }
}
