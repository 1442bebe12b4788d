/*
    session - Per-principal owner of mirrors

    Login resolves the authentication claim to an account id, follows
    /userAccounts/{account} to the profile it is linked to (the account id
    itself when unlinked), reads or creates that profile under /users/{id}
    and keeps it as the shared principal context. Every account a profile
    lists under `linked` is pointed back at it. Mirrors are opened lazily, one per type, and
    all of them are torn down together on logout.

    Before login the session is anonymous: mirrors still open, but only
    public types yield records.
*/

use crate::config::{Config, ConfigError};
use crate::core_mirror::{MirrorContext, MirrorError, MirrorResult, SecureMirror};
use crate::core_policy::{
    is_truthy, AccessToken, ClaimResolver, PermissionEvaluator, PolicySet, Principal,
    PrincipalContext, TypePolicy,
};
use crate::core_remote::{RemoteStore, StorePath, LINKED_KEY, USERS_ROOT};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How a login resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// An existing profile was loaded
    Authenticated { principal_id: String },
    /// No profile existed; an empty one was written
    ProfileCreated { principal_id: String },
}

impl LoginOutcome {
    pub fn principal_id(&self) -> &str {
        match self {
            LoginOutcome::Authenticated { principal_id }
            | LoginOutcome::ProfileCreated { principal_id } => principal_id,
        }
    }
}

pub struct Session {
    store: Arc<dyn RemoteStore>,
    policies: PolicySet,
    evaluator: PermissionEvaluator,
    event_capacity: usize,
    profile_type: String,
    principal: Option<Arc<PrincipalContext>>,
    mirrors: Mutex<BTreeMap<String, SecureMirror>>,
}

impl Session {
    pub fn new(store: Arc<dyn RemoteStore>, policies: PolicySet) -> Self {
        Session {
            store,
            policies,
            evaluator: PermissionEvaluator::default(),
            event_capacity: 256,
            profile_type: USERS_ROOT.to_string(),
            principal: None,
            mirrors: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build a session from validated configuration
    pub fn from_config(store: Arc<dyn RemoteStore>, config: &Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut session = Session::new(store, config.policy_set()?);
        session.evaluator = config.evaluator();
        session.event_capacity = config.mirror.event_capacity;
        session.profile_type = config.bootstrap.profile_type.clone();
        Ok(session)
    }

    pub fn with_evaluator(mut self, evaluator: PermissionEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn principal(&self) -> Option<&Arc<PrincipalContext>> {
        self.principal.as_ref()
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Policy guarding profile reads; defaults to member-only access
    fn profile_policy(&self) -> TypePolicy {
        self.policies
            .get(&self.profile_type)
            .cloned()
            .unwrap_or_else(|| TypePolicy {
                name: self.profile_type.clone(),
                access: vec![AccessToken::User],
            })
    }

    /// Resolve the claim, load or create the profile, and become that principal
    ///
    /// Any mirrors opened before login are torn down first.
    pub async fn login(&mut self, resolver: Arc<dyn ClaimResolver>) -> MirrorResult<LoginOutcome> {
        let denied = |principal: String| MirrorError::PermissionDenied {
            principal,
            action: "login".to_string(),
            type_name: self.profile_type.clone(),
        };

        let Some(claimed) = resolver.resolve_claim() else {
            warn!("login without a claim");
            return Err(denied("anonymous".to_string()));
        };

        let account_link = self
            .store
            .get(&StorePath::account_link(&claimed))
            .await?
            .and_then(|link| link.as_str().map(str::to_string));
        let profile_id = account_link.clone().unwrap_or_else(|| claimed.clone());

        // No principal yet: only the bootstrap rule can allow this read.
        let mut bootstrap = self
            .evaluator
            .clone()
            .with_bootstrap(&self.profile_type, resolver);
        if let Some(link) = account_link {
            bootstrap = bootstrap.with_account_link(link);
        }

        let path = StorePath::profile(&profile_id);
        let stored = self.store.get(&path).await?;
        if !bootstrap.permit(None, &self.profile_policy(), Some(&profile_id), stored.as_ref()) {
            warn!(account = %claimed, profile = %profile_id, "profile read refused");
            return Err(denied(claimed));
        }

        self.logout().await;

        let (principal, outcome) = match stored {
            Some(profile) => {
                let linked = self.link_accounts(&profile_id, &profile).await?;
                debug!(profile = %profile_id, linked, "linked accounts refreshed");
                (
                    Principal::from_profile(&profile_id, Some(&profile)),
                    LoginOutcome::Authenticated {
                        principal_id: profile_id.clone(),
                    },
                )
            }
            None => {
                let principal = Principal::new(&profile_id);
                let mut profile = principal.to_profile();
                if let Value::Object(fields) = &mut profile {
                    let mut linked = Map::new();
                    linked.insert(claimed.clone(), Value::Bool(true));
                    fields.insert(LINKED_KEY.to_string(), Value::Object(linked));
                }
                self.store.set(&path, profile).await?;
                self.store
                    .set(
                        &StorePath::account_link(&claimed),
                        Value::String(profile_id.clone()),
                    )
                    .await?;
                (
                    principal,
                    LoginOutcome::ProfileCreated {
                        principal_id: profile_id.clone(),
                    },
                )
            }
        };

        self.principal = Some(PrincipalContext::new(principal));
        info!(account = %claimed, principal = %profile_id, outcome = ?outcome, "logged in");
        Ok(outcome)
    }

    /// Point every truthy `linked` account of a profile back at it
    async fn link_accounts(&self, profile_id: &str, profile: &Value) -> MirrorResult<usize> {
        let Some(accounts) = profile.get(LINKED_KEY).and_then(Value::as_object) else {
            return Ok(0);
        };
        let mut linked = 0;
        for (account, flag) in accounts {
            if !is_truthy(flag) {
                continue;
            }
            self.store
                .set(
                    &StorePath::account_link(account),
                    Value::String(profile_id.to_string()),
                )
                .await?;
            linked += 1;
        }
        Ok(linked)
    }

    /// The mirror for `type_name`, opened on first use
    pub async fn mirror(&self, type_name: &str) -> MirrorResult<SecureMirror> {
        let mut mirrors = self.mirrors.lock().await;
        if let Some(mirror) = mirrors.get(type_name) {
            if !mirror.is_torn_down() {
                return Ok(mirror.clone());
            }
        }

        let policy = self
            .policies
            .get(type_name)
            .cloned()
            .ok_or_else(|| MirrorError::UnknownType(type_name.to_string()))?;
        let ctx = MirrorContext::new(self.store.clone(), self.principal.clone())
            .with_evaluator(self.evaluator.clone())
            .with_event_capacity(self.event_capacity);

        let mirror = SecureMirror::open(ctx, policy).await?;
        mirrors.insert(type_name.to_string(), mirror.clone());
        debug!(type_name, open = mirrors.len(), "mirror registered");
        Ok(mirror)
    }

    /// Types with a live mirror
    pub async fn open_types(&self) -> Vec<String> {
        self.mirrors
            .lock()
            .await
            .iter()
            .filter(|(_, mirror)| !mirror.is_torn_down())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Tear down every mirror and forget the principal
    pub async fn logout(&mut self) {
        let mirrors = std::mem::take(&mut *self.mirrors.lock().await);
        for mirror in mirrors.values() {
            mirror.destroy().await;
        }
        if let Some(principal) = self.principal.take() {
            info!(principal = %principal.id(), mirrors = mirrors.len(), "logged out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_policy::StaticClaim;
    use crate::core_remote::MemoryStore;
    use serde_json::json;

    fn policies() -> PolicySet {
        PolicySet::from_policies([
            TypePolicy::new("orders", ["user", "admin"]).unwrap(),
            TypePolicy::new("news", ["public"]).unwrap(),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_existing_profile() {
        let store = Arc::new(MemoryStore::with_data(json!({
            "users": { "u1": { "roles": { "admin": true }, "orders": { "o1": true } } }
        })));
        let mut session = Session::new(store, policies());

        let outcome = session
            .login(Arc::new(StaticClaim::new("u1")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Authenticated {
                principal_id: "u1".to_string()
            }
        );

        let principal = session.principal().unwrap().snapshot().await;
        assert!(principal.has_role("admin"));
        assert!(principal.index.contains("orders", "o1"));
    }

    #[tokio::test]
    async fn test_login_creates_missing_profile() {
        let store = Arc::new(MemoryStore::new());
        let mut session = Session::new(store.clone(), policies());

        let outcome = session
            .login(Arc::new(StaticClaim::new("u9")))
            .await
            .unwrap();
        assert!(matches!(outcome, LoginOutcome::ProfileCreated { .. }));
        assert!(store.get(&StorePath::profile("u9")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_new_profile_is_linked_to_its_account() {
        let store = Arc::new(MemoryStore::new());
        let mut session = Session::new(store.clone(), policies());
        session
            .login(Arc::new(StaticClaim::new("u9")))
            .await
            .unwrap();

        assert_eq!(
            store.get(&StorePath::profile("u9")).await.unwrap(),
            Some(json!({ "id": "u9", "linked": { "u9": true } }))
        );
        assert_eq!(
            store.get(&StorePath::account_link("u9")).await.unwrap(),
            Some(json!("u9"))
        );
        // The linked map is not mistaken for a personal index.
        let principal = session.principal().unwrap().snapshot().await;
        assert!(principal.index.ids("linked").is_empty());
    }

    #[tokio::test]
    async fn test_login_follows_account_link() {
        let store = Arc::new(MemoryStore::with_data(json!({
            "userAccounts": { "github-42": "p7" },
            "users": { "p7": {
                "roles": { "admin": true },
                "linked": { "github-42": true, "mail-7": true, "old": false }
            } }
        })));
        let mut session = Session::new(store.clone(), policies());

        let outcome = session
            .login(Arc::new(StaticClaim::new("github-42")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::Authenticated {
                principal_id: "p7".to_string()
            }
        );
        assert!(session.principal().unwrap().snapshot().await.has_role("admin"));

        // Every linked account now resolves to the same profile.
        assert_eq!(
            store.get(&StorePath::account_link("mail-7")).await.unwrap(),
            Some(json!("p7"))
        );
        assert_eq!(store.get(&StorePath::account_link("old")).await.unwrap(), None);
        assert!(store.get(&StorePath::profile("github-42")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_linked_profile_is_readable_before_the_mapping_exists() {
        let store = Arc::new(MemoryStore::with_data(json!({
            "users": { "mail-7": { "linked": { "mail-7": true } } }
        })));
        let mut session = Session::new(store.clone(), policies());
        session
            .login(Arc::new(StaticClaim::new("mail-7")))
            .await
            .unwrap();
        assert_eq!(
            store.get(&StorePath::account_link("mail-7")).await.unwrap(),
            Some(json!("mail-7"))
        );
    }

    #[tokio::test]
    async fn test_login_without_claim_is_denied() {
        let mut session = Session::new(Arc::new(MemoryStore::new()), policies());
        let err = session
            .login(Arc::new(StaticClaim::anonymous()))
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::PermissionDenied { .. }));
        assert!(session.principal().is_none());
    }

    #[tokio::test]
    async fn test_mirrors_are_created_once_and_torn_down_on_logout() {
        let store = Arc::new(MemoryStore::new());
        let mut session = Session::new(store.clone(), policies());
        session
            .login(Arc::new(StaticClaim::new("u1")))
            .await
            .unwrap();

        let first = session.mirror("orders").await.unwrap();
        first.loaded().await.unwrap();
        let live = store.live_subscriptions();
        assert!(live > 0);

        // A second request reuses the open mirror.
        session.mirror("orders").await.unwrap();
        assert_eq!(store.live_subscriptions(), live);
        assert_eq!(session.open_types().await, vec!["orders".to_string()]);

        session.logout().await;
        assert!(first.is_torn_down());
        assert!(session.open_types().await.is_empty());
        assert!(session.principal().is_none());
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let session = Session::new(Arc::new(MemoryStore::new()), policies());
        assert!(matches!(
            session.mirror("invoices").await,
            Err(MirrorError::UnknownType(_))
        ));
    }
}
