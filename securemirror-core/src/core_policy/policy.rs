//! Type-level access policies

use crate::core_remote::{LINKED_KEY, QUEUE_KEY, ROLES_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while building policies
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Policy for '{0}' has an empty access list")]
    EmptyAccess(String),

    #[error("Type name '{0}' is reserved or not addressable")]
    ReservedName(String),

    #[error("Duplicate policy for type '{0}'")]
    Duplicate(String),
}

/// One entry of a policy's access list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AccessToken {
    /// Everyone may read and write
    Public,
    /// Principals listed on the record or in their personal index
    User,
    /// Principals holding the named role
    Role(String),
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        match self {
            AccessToken::Public => "public",
            AccessToken::User => "user",
            AccessToken::Role(role) => role,
        }
    }
}

impl From<&str> for AccessToken {
    fn from(raw: &str) -> Self {
        match raw {
            "public" => AccessToken::Public,
            "user" => AccessToken::User,
            role => AccessToken::Role(role.to_string()),
        }
    }
}

impl From<String> for AccessToken {
    fn from(raw: String) -> Self {
        AccessToken::from(raw.as_str())
    }
}

impl From<AccessToken> for String {
    fn from(token: AccessToken) -> Self {
        token.as_str().to_string()
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access configuration shared by every record of one type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePolicy {
    pub name: String,
    pub access: Vec<AccessToken>,
}

impl TypePolicy {
    /// Build a policy; the access list keeps its order and drops repeats
    pub fn new<I, T>(name: impl Into<String>, access: I) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = T>,
        T: Into<AccessToken>,
    {
        let mut tokens: Vec<AccessToken> = Vec::new();
        for token in access.into_iter().map(Into::into) {
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
        let policy = TypePolicy {
            name: name.into(),
            access: tokens,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.is_empty()
            || self.name.contains('/')
            || self.name == ROLES_KEY
            || self.name == QUEUE_KEY
            || self.name == LINKED_KEY
        {
            return Err(PolicyError::ReservedName(self.name.clone()));
        }
        if self.access.is_empty() {
            return Err(PolicyError::EmptyAccess(self.name.clone()));
        }
        Ok(())
    }

    pub fn is_public(&self) -> bool {
        self.access.contains(&AccessToken::Public)
    }
}

/// Policies for every known type, keyed by type name
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, TypePolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_policies(policies: impl IntoIterator<Item = TypePolicy>) -> Result<Self, PolicyError> {
        let mut set = PolicySet::new();
        for policy in policies {
            set.insert(policy)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, policy: TypePolicy) -> Result<(), PolicyError> {
        policy.validate()?;
        if self.policies.contains_key(&policy.name) {
            return Err(PolicyError::Duplicate(policy.name));
        }
        self.policies.insert(policy.name.clone(), policy);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&TypePolicy> {
        self.policies.get(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_parse_from_strings() {
        assert_eq!(AccessToken::from("public"), AccessToken::Public);
        assert_eq!(AccessToken::from("user"), AccessToken::User);
        assert_eq!(
            AccessToken::from("admin"),
            AccessToken::Role("admin".to_string())
        );
    }

    #[test]
    fn test_policy_keeps_order_and_dedupes() {
        let policy = TypePolicy::new("orders", ["admin", "user", "admin"]).unwrap();
        assert_eq!(
            policy.access,
            vec![AccessToken::Role("admin".to_string()), AccessToken::User]
        );
        assert!(!policy.is_public());
    }

    #[test]
    fn test_policy_validation() {
        assert_eq!(
            TypePolicy::new("orders", Vec::<&str>::new()),
            Err(PolicyError::EmptyAccess("orders".to_string()))
        );
        assert!(matches!(
            TypePolicy::new("dataQueue", ["user"]),
            Err(PolicyError::ReservedName(_))
        ));
        assert!(matches!(
            TypePolicy::new("linked", ["user"]),
            Err(PolicyError::ReservedName(_))
        ));
        assert!(matches!(
            TypePolicy::new("a/b", ["user"]),
            Err(PolicyError::ReservedName(_))
        ));
    }

    #[test]
    fn test_policy_serde_uses_plain_strings() {
        let policy = TypePolicy::new("orders", ["public"]).unwrap();
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(json, r#"{"name":"orders","access":["public"]}"#);

        let back: TypePolicy = serde_json::from_str(&json).unwrap();
        assert!(back.is_public());
    }

    #[test]
    fn test_policy_set_rejects_duplicates() {
        let mut set = PolicySet::new();
        set.insert(TypePolicy::new("orders", ["user"]).unwrap()).unwrap();
        let err = set
            .insert(TypePolicy::new("orders", ["public"]).unwrap())
            .unwrap_err();
        assert_eq!(err, PolicyError::Duplicate("orders".to_string()));
        assert_eq!(set.len(), 1);
    }
}
