//! Immutable, permission-filtered projections of mirror state

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One visible record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: String,
    pub value: Value,
}

impl MirrorRecord {
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        MirrorRecord {
            id: id.into(),
            value,
        }
    }
}

/// Point-in-time view of every record visible to the mirror's principal
///
/// Records are ordered by id. Ordering is re-derived on every snapshot and
/// never tracked from move events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub type_name: String,
    pub records: BTreeMap<String, Value>,
}

impl Snapshot {
    pub fn empty(type_name: impl Into<String>) -> Self {
        Snapshot {
            type_name: type_name.into(),
            records: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of `id` in snapshot order
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.records.keys().position(|key| key == id)
    }

    pub fn to_array(&self) -> Vec<MirrorRecord> {
        self.records
            .iter()
            .map(|(id, value)| MirrorRecord::new(id.clone(), value.clone()))
            .collect()
    }

    /// The snapshot as one `{id: value}` object
    pub fn to_value(&self) -> Value {
        let map: Map<String, Value> = self
            .records
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_order_and_lookup() {
        let mut snapshot = Snapshot::empty("orders");
        snapshot.records.insert("b".to_string(), json!(2));
        snapshot.records.insert("a".to_string(), json!(1));

        assert_eq!(snapshot.ids(), vec!["a", "b"]);
        assert_eq!(snapshot.index_of("b"), Some(1));
        assert_eq!(snapshot.index_of("z"), None);
        assert_eq!(snapshot.to_array()[0], MirrorRecord::new("a", json!(1)));
        assert_eq!(snapshot.to_value(), json!({ "a": 1, "b": 2 }));
    }
}
