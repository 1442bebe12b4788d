//! Permission model
//!
//! Type policies, principals with their roles and personal indexes, and the
//! evaluator deciding record visibility.

pub mod evaluator;
pub mod policy;
pub mod principal;
pub mod record;

pub use evaluator::{ClaimResolver, Grant, GrantPrecedence, PermissionEvaluator, StaticClaim};
pub use policy::{AccessToken, PolicyError, PolicySet, TypePolicy};
pub use principal::{PersonalIndex, Principal, PrincipalContext};
pub use record::{is_member, is_truthy, members, MembershipDiff, USERS_FIELD};
