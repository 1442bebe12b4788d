/*
    Snapshot Visibility Properties

    A snapshot contains exactly the materialized records the evaluator
    permits at the moment the snapshot is taken. Principal state is read at
    call time, so a revoked role or index flag hides records immediately,
    before any store event arrives.
*/

use proptest::prelude::*;
use securemirror_core::core_policy::{PermissionEvaluator, Principal};
use securemirror_core::test_utils::*;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const PRINCIPALS: [&str; 3] = ["u1", "u2", "u3"];

fn record(id: &str, members: &BTreeSet<&str>) -> Value {
    let users: Map<String, Value> = members.iter().map(|m| (m.to_string(), json!(true))).collect();
    if users.is_empty() {
        json!({ "title": id })
    } else {
        json!({ "title": id, "users": users })
    }
}

fn members() -> impl Strategy<Value = BTreeSet<&'static str>> {
    prop::collection::btree_set(prop::sample::select(PRINCIPALS.to_vec()), 0..3)
}

fn permitted(principal: &Principal, records: &BTreeMap<String, Value>) -> Vec<String> {
    let policy = orders_policy(&["user", "admin"]);
    let evaluator = PermissionEvaluator::default();
    records
        .iter()
        .filter(|(id, value)| {
            evaluator.permit(Some(principal), &policy, Some(id.as_str()), Some(*value))
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_snapshot_matches_permit_after_role_change(
        memberships in prop::collection::btree_map("r[0-9]", members(), 1..6),
        indexed in prop::collection::btree_set("r[0-9]", 0..4),
        keep_role in any::<bool>(),
    ) {
        let records: BTreeMap<String, Value> = memberships
            .iter()
            .map(|(id, members)| (id.clone(), record(id, members)))
            .collect();

        runtime().block_on(async {
            let store = store_with(json!({ "orders": records.clone() }));
            let mut builder = TestPrincipalBuilder::new("u1").with_role("admin");
            for id in &indexed {
                builder = builder.with_indexed("orders", id);
            }
            let u1 = builder.build();

            // Blanket access while opening materializes every record.
            let mirror = open_mirror(&store, Some(u1.clone()), orders_policy(&["user", "admin"])).await;
            prop_assert!(mirror.is_root_bound());
            prop_assert_eq!(mirror.snapshot().await.len(), records.len());

            if !keep_role {
                u1.set_role("admin", false).await;
            }

            let expected = permitted(&u1.snapshot().await, &records);
            let snapshot = mirror.snapshot().await;
            let actual: Vec<String> = snapshot.ids().into_iter().map(String::from).collect();
            prop_assert_eq!(actual, expected);

            for id in records.keys() {
                prop_assert_eq!(mirror.snapshot_child(id).await.is_some(), snapshot.contains(id));
            }

            mirror.destroy().await;
            Ok(())
        })?;
    }

    #[test]
    fn prop_index_flags_gate_index_driven_mirrors(
        memberships in prop::collection::btree_map("r[0-9]", members(), 1..6),
        revoked in prop::collection::btree_set("r[0-9]", 0..4),
    ) {
        let records: BTreeMap<String, Value> = memberships
            .iter()
            .map(|(id, members)| (id.clone(), record(id, members)))
            .collect();

        runtime().block_on(async {
            let store = store_with(json!({ "orders": records.clone() }));
            let mut builder = TestPrincipalBuilder::new("u1");
            for id in records.keys() {
                builder = builder.with_indexed("orders", id);
            }
            let u1 = builder.build();

            let mirror = open_mirror(&store, Some(u1.clone()), orders_policy(&["user"])).await;
            prop_assert!(!mirror.is_root_bound());
            prop_assert_eq!(mirror.snapshot().await.len(), records.len());

            // Flags cleared locally only; the records stay materialized.
            for id in &revoked {
                u1.set_index_flag("orders", id, false).await;
            }

            let policy = orders_policy(&["user"]);
            let principal = u1.snapshot().await;
            let snapshot = mirror.snapshot().await;
            for (id, value) in &records {
                let expected = PermissionEvaluator::default()
                    .permit(Some(&principal), &policy, Some(id.as_str()), Some(value));
                prop_assert_eq!(snapshot.contains(id), expected, "record {}", id);
            }

            mirror.destroy().await;
            Ok(())
        })?;
    }
}
