//! Helpers for reading membership off opaque record values

use serde_json::Value;
use std::collections::BTreeSet;

/// Field of a record holding `principal-id -> bool`
pub const USERS_FIELD: &str = "users";

/// Loose truthiness of a stored flag
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// True if `value.users[principal_id]` is truthy
pub fn is_member(value: &Value, principal_id: &str) -> bool {
    value
        .get(USERS_FIELD)
        .and_then(|users| users.get(principal_id))
        .map(is_truthy)
        .unwrap_or(false)
}

/// Principals with a truthy flag in `value.users`
pub fn members(value: Option<&Value>) -> BTreeSet<String> {
    value
        .and_then(|v| v.get(USERS_FIELD))
        .and_then(Value::as_object)
        .map(|users| {
            users
                .iter()
                .filter(|(_, flag)| is_truthy(flag))
                .map(|(id, _)| id.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Membership change between two versions of a record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl MembershipDiff {
    /// Symmetric difference of the `users` maps of `previous` and `next`
    pub fn between(previous: Option<&Value>, next: Option<&Value>) -> Self {
        let before = members(previous);
        let after = members(next);
        MembershipDiff {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_members_ignores_falsy_flags() {
        let record = json!({ "users": { "u1": true, "u2": false, "u3": 1 } });
        let found: Vec<String> = members(Some(&record)).into_iter().collect();
        assert_eq!(found, vec!["u1".to_string(), "u3".to_string()]);
        assert!(is_member(&record, "u1"));
        assert!(!is_member(&record, "u2"));
        assert!(members(None).is_empty());
    }

    #[test]
    fn test_diff_is_symmetric_difference() {
        let before = json!({ "users": { "u1": true, "u2": true } });
        let after = json!({ "users": { "u2": true, "u3": true } });
        let diff = MembershipDiff::between(Some(&before), Some(&after));
        assert_eq!(diff.added.into_iter().collect::<Vec<_>>(), vec!["u3"]);
        assert_eq!(diff.removed.into_iter().collect::<Vec<_>>(), vec!["u1"]);
    }

    #[test]
    fn test_diff_from_nothing() {
        let after = json!({ "users": { "u1": true } });
        let diff = MembershipDiff::between(None, Some(&after));
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());
        assert!(MembershipDiff::between(Some(&after), Some(&after)).is_empty());
    }
}
