//! Test fixtures for stores, principals and mirrors

use crate::core_mirror::{MirrorContext, SecureMirror};
use crate::core_policy::{PermissionEvaluator, Principal, PrincipalContext, TypePolicy};
use crate::core_remote::MemoryStore;
use serde_json::Value;
use std::sync::Arc;

/// Policy over `orders` with the given access tokens
pub fn orders_policy(access: &[&str]) -> TypePolicy {
    match TypePolicy::new("orders", access.iter().copied()) {
        Ok(policy) => policy,
        Err(e) => panic!("invalid test policy: {}", e),
    }
}

/// Builder for a principal as it would be loaded from its profile
pub struct TestPrincipalBuilder {
    principal: Principal,
}

impl TestPrincipalBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            principal: Principal::new(id),
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.principal = self.principal.with_role(role);
        self
    }

    pub fn with_indexed(mut self, type_name: &str, record_id: &str) -> Self {
        self.principal = self.principal.with_indexed(type_name, record_id);
        self
    }

    pub fn build(self) -> Arc<PrincipalContext> {
        PrincipalContext::new(self.principal)
    }
}

/// Principal with no roles and an empty index
pub fn principal(id: &str) -> Arc<PrincipalContext> {
    TestPrincipalBuilder::new(id).build()
}

/// Principal whose context mirrors the profile stored for it in `store`
pub fn principal_from_store(store: &MemoryStore, id: &str) -> Arc<PrincipalContext> {
    let profile = store.dump().get("users").and_then(|users| users.get(id)).cloned();
    PrincipalContext::new(Principal::from_profile(id, profile.as_ref()))
}

pub fn store_with(data: Value) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_data(data))
}

/// Open a mirror and wait for its initial load
pub async fn open_mirror(
    store: &Arc<MemoryStore>,
    principal: Option<Arc<PrincipalContext>>,
    policy: TypePolicy,
) -> SecureMirror {
    open_mirror_with(store, principal, policy, PermissionEvaluator::default()).await
}

pub async fn open_mirror_with(
    store: &Arc<MemoryStore>,
    principal: Option<Arc<PrincipalContext>>,
    policy: TypePolicy,
    evaluator: PermissionEvaluator,
) -> SecureMirror {
    let ctx = MirrorContext::new(store.clone(), principal).with_evaluator(evaluator);
    let mirror = match SecureMirror::open(ctx, policy).await {
        Ok(mirror) => mirror,
        Err(e) => panic!("mirror failed to open: {}", e),
    };
    if let Err(e) = super::with_timeout(super::WAIT, mirror.loaded()).await {
        panic!("mirror did not load: {}", e);
    }
    mirror
}
