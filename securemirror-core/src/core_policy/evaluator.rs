//! Permission evaluation
//!
//! Decides whether a principal may see or write a record. Pure and
//! deterministic: nothing is cached, every read re-evaluates against the
//! principal state and record value it is handed.
//!
//! Checks here are advisory. The remote store enforces the same policy on
//! its own side.

use super::policy::{AccessToken, TypePolicy};
use super::principal::Principal;
use super::record::{is_member, is_truthy};
use crate::core_remote::LINKED_KEY;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Why access was granted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// The policy lists `public`
    Public,
    /// The principal holds this role
    Role(String),
    /// No record id given and `record.users[principal]` is truthy
    Membership,
    /// The principal's personal index lists the id
    Index,
    /// No principal yet, but the profile belongs to the claimed account
    Bootstrap,
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::Public => write!(f, "public"),
            Grant::Role(role) => write!(f, "role:{}", role),
            Grant::Membership => write!(f, "membership"),
            Grant::Index => write!(f, "index"),
            Grant::Bootstrap => write!(f, "bootstrap"),
        }
    }
}

/// Order in which access tokens are consulted
///
/// Precedence only decides which grant is reported first; the set of
/// principals granted access is the same under every ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantPrecedence {
    /// Follow the policy's access list order
    #[default]
    TokenOrder,
    /// Role tokens before the `user` token
    RolesFirst,
    /// The `user` token before role tokens
    MembershipFirst,
}

/// Maps the current authentication claim to a principal id
///
/// Used only before a principal is loaded, to let the session read its own
/// profile record.
pub trait ClaimResolver: Send + Sync {
    fn resolve_claim(&self) -> Option<String>;
}

/// Resolver returning a fixed id
#[derive(Debug, Clone, Default)]
pub struct StaticClaim(pub Option<String>);

impl StaticClaim {
    pub fn new(principal_id: impl Into<String>) -> Self {
        StaticClaim(Some(principal_id.into()))
    }

    pub fn anonymous() -> Self {
        StaticClaim(None)
    }
}

impl ClaimResolver for StaticClaim {
    fn resolve_claim(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Clone)]
struct Bootstrap {
    profile_type: String,
    resolver: Arc<dyn ClaimResolver>,
    /// Profile id that `/userAccounts/{claim}` points at
    account_link: Option<String>,
}

/// Permission evaluator
#[derive(Clone, Default)]
pub struct PermissionEvaluator {
    precedence: GrantPrecedence,
    bootstrap: Option<Bootstrap>,
}

impl fmt::Debug for PermissionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionEvaluator")
            .field("precedence", &self.precedence)
            .field(
                "bootstrap_profile_type",
                &self.bootstrap.as_ref().map(|b| b.profile_type.as_str()),
            )
            .finish()
    }
}

impl PermissionEvaluator {
    pub fn new(precedence: GrantPrecedence) -> Self {
        PermissionEvaluator {
            precedence,
            bootstrap: None,
        }
    }

    /// Allow principal-less reads of `profile_type/{claimed id}`
    pub fn with_bootstrap(
        mut self,
        profile_type: impl Into<String>,
        resolver: Arc<dyn ClaimResolver>,
    ) -> Self {
        self.bootstrap = Some(Bootstrap {
            profile_type: profile_type.into(),
            resolver,
            account_link: None,
        });
        self
    }

    /// Also allow the profile the claimed account is linked to
    ///
    /// No effect without [`with_bootstrap`](Self::with_bootstrap).
    pub fn with_account_link(mut self, profile_id: impl Into<String>) -> Self {
        if let Some(bootstrap) = self.bootstrap.as_mut() {
            bootstrap.account_link = Some(profile_id.into());
        }
        self
    }

    pub fn precedence(&self) -> GrantPrecedence {
        self.precedence
    }

    /// Boolean form of [`evaluate`](Self::evaluate)
    pub fn permit(
        &self,
        principal: Option<&Principal>,
        policy: &TypePolicy,
        id: Option<&str>,
        value: Option<&Value>,
    ) -> bool {
        self.evaluate(principal, policy, id, value).is_some()
    }

    /// Type-level access: `public` or a held role, no record context
    pub fn can_write_type(&self, principal: Option<&Principal>, policy: &TypePolicy) -> bool {
        self.permit(principal, policy, None, None)
    }

    /// First matching grant, or `None` when access is denied
    pub fn evaluate(
        &self,
        principal: Option<&Principal>,
        policy: &TypePolicy,
        id: Option<&str>,
        value: Option<&Value>,
    ) -> Option<Grant> {
        if policy.is_public() {
            return Some(Grant::Public);
        }

        let Some(principal) = principal else {
            return self.bootstrap_grant(policy, id, value);
        };

        for token in self.ordered_tokens(policy) {
            match token {
                AccessToken::Public => return Some(Grant::Public),
                // With an id only the personal index counts; `users` on the
                // value is consulted for id-less checks such as creation.
                AccessToken::User => match (id, value) {
                    (Some(id), _) if principal.index.contains(&policy.name, id) => {
                        return Some(Grant::Index);
                    }
                    (None, Some(value)) if is_member(value, &principal.id) => {
                        return Some(Grant::Membership);
                    }
                    _ => {}
                },
                AccessToken::Role(role) => {
                    if principal.has_role(role) {
                        return Some(Grant::Role(role.clone()));
                    }
                }
            }
        }
        None
    }

    fn ordered_tokens<'a>(&self, policy: &'a TypePolicy) -> Vec<&'a AccessToken> {
        let mut tokens: Vec<&AccessToken> = policy.access.iter().collect();
        match self.precedence {
            GrantPrecedence::TokenOrder => {}
            GrantPrecedence::RolesFirst => {
                tokens.sort_by_key(|t| !matches!(t, AccessToken::Role(_)));
            }
            GrantPrecedence::MembershipFirst => {
                tokens.sort_by_key(|t| !matches!(t, AccessToken::User));
            }
        }
        tokens
    }

    fn bootstrap_grant(
        &self,
        policy: &TypePolicy,
        id: Option<&str>,
        value: Option<&Value>,
    ) -> Option<Grant> {
        let bootstrap = self.bootstrap.as_ref()?;
        if policy.name != bootstrap.profile_type {
            return None;
        }
        let claimed = bootstrap.resolver.resolve_claim()?;
        let linked = value
            .and_then(|v| v.get(LINKED_KEY))
            .and_then(|accounts| accounts.get(&claimed))
            .map(is_truthy)
            .unwrap_or(false);
        let id = id?;
        let allowed =
            linked || id == claimed || bootstrap.account_link.as_deref() == Some(id);
        allowed.then_some(Grant::Bootstrap)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Map};

    fn access_token() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["user", "admin", "editor"])
    }

    fn record(members: &[String]) -> Value {
        let users: Map<String, Value> = members.iter().map(|m| (m.clone(), json!(true))).collect();
        json!({ "users": users })
    }

    // Property: precedence changes the reported grant, never the decision
    proptest! {
        #[test]
        fn prop_precedence_preserves_decision(
            access in prop::collection::vec(access_token(), 1..4),
            roles in prop::collection::vec(access_token(), 0..3),
            members in prop::collection::vec(prop::sample::select(vec!["u1".to_string(), "u2".to_string()]), 0..3),
            indexed in any::<bool>(),
        ) {
            let policy = TypePolicy::new("orders", access.iter().copied()).unwrap();
            let mut principal = Principal::new("u1");
            for role in roles {
                principal = principal.with_role(role);
            }
            if indexed {
                principal = principal.with_indexed("orders", "o1");
            }
            let value = record(&members);

            let decisions: Vec<bool> = [
                GrantPrecedence::TokenOrder,
                GrantPrecedence::RolesFirst,
                GrantPrecedence::MembershipFirst,
            ]
            .into_iter()
            .map(|p| {
                PermissionEvaluator::new(p).permit(Some(&principal), &policy, Some("o1"), Some(&value))
            })
            .collect();

            prop_assert!(decisions.iter().all(|d| *d == decisions[0]));
        }
    }

    // Property: a record listing the principal passes the id-less `user` check
    proptest! {
        #[test]
        fn prop_membership_grants_access(
            others in prop::collection::vec("[a-z]{2,6}", 0..4),
        ) {
            let policy = TypePolicy::new("orders", ["user"]).unwrap();
            let mut members = others.clone();
            members.push("u1".to_string());
            let principal = Principal::new("u1");

            prop_assert!(PermissionEvaluator::default().permit(
                Some(&principal),
                &policy,
                None,
                Some(&record(&members)),
            ));
            // Once an id is known only the personal index decides.
            prop_assert!(!PermissionEvaluator::default().permit(
                Some(&principal),
                &policy,
                Some("o1"),
                Some(&record(&members)),
            ));
            prop_assert!(!PermissionEvaluator::default().permit(
                Some(&principal),
                &policy,
                None,
                Some(&record(&others.into_iter().filter(|o| o != "u1").collect::<Vec<_>>())),
            ));
        }
    }
}
