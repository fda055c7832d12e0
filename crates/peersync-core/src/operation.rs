use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a logged row-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change recorded against the local cache since the last
/// successful sync.
///
/// Operations are immutable once logged and are dropped only after a sync
/// cycle durably reflects them in an uploaded snapshot. `local_id` is the
/// primary key the row has in the originating cache; for inserts it is never
/// reused at the destination (the target assigns a fresh key on replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Monotonically increasing per-process sequence number
    pub sequence_id: u64,
    /// Insert, update, or delete
    pub kind: OperationKind,
    /// Table the row belongs to
    pub table: String,
    /// Primary key of the row in the originating cache
    pub local_id: i64,
    /// Column name -> value; empty for deletes
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// When the operation was logged
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_json() {
        let mut payload = Map::new();
        payload.insert("name".to_string(), Value::String("widget".to_string()));
        payload.insert("qty".to_string(), Value::from(4));

        let op = Operation {
            sequence_id: 7,
            kind: OperationKind::Insert,
            table: "items".to_string(),
            local_id: 42,
            payload,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence_id, 7);
        assert_eq!(back.kind, OperationKind::Insert);
        assert_eq!(back.table, "items");
        assert_eq!(back.local_id, 42);
        assert_eq!(back.payload.get("qty"), Some(&Value::from(4)));
    }

    #[test]
    fn delete_payload_defaults_to_empty() {
        let json = r#"{
            "sequence_id": 1,
            "kind": "delete",
            "table": "items",
            "local_id": 3,
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert!(op.payload.is_empty());
    }
}
