use std::sync::Mutex;

use chrono::Utc;
use peersync_core::{Operation, OperationKind};
use serde_json::{Map, Value};

/// In-process ordered log of row-level operations since the last successful
/// sync.
///
/// Logging is synchronous and does no I/O; ordering across kinds and tables
/// is preserved so an insert-then-update on the same row replays in that
/// order. The log is in-memory only: a crash before syncing loses unsynced
/// operations (the local cache write itself was already durable).
#[derive(Debug, Default)]
pub struct OperationTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_sequence: u64,
    operations: Vec<Operation>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_insert(&self, table: &str, local_id: i64, payload: Map<String, Value>) {
        self.log(OperationKind::Insert, table, local_id, payload);
    }

    pub fn log_update(&self, table: &str, local_id: i64, payload: Map<String, Value>) {
        self.log(OperationKind::Update, table, local_id, payload);
    }

    pub fn log_delete(&self, table: &str, local_id: i64) {
        self.log(OperationKind::Delete, table, local_id, Map::new());
    }

    pub fn log(&self, kind: OperationKind, table: &str, local_id: i64, payload: Map<String, Value>) {
        let mut inner = self.inner.lock().unwrap();
        let sequence_id = inner.next_sequence;
        inner.next_sequence += 1;
        inner.operations.push(Operation {
            sequence_id,
            kind,
            table: table.to_string(),
            local_id,
            payload,
            timestamp: Utc::now(),
        });
    }

    /// Snapshot of pending operations in logged order.
    pub fn pending(&self) -> Vec<Operation> {
        self.inner.lock().unwrap().operations.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().operations.len()
    }

    /// Drop all pending operations. Called only after a sync cycle has
    /// durably reflected them in an uploaded snapshot.
    pub fn clear(&self) {
        self.inner.lock().unwrap().operations.clear();
    }

    /// Drop operations up to and including `max_sequence_id`. Operations
    /// logged after a sync cycle snapshotted the pending log stay queued:
    /// they are not reflected in that cycle's upload.
    pub fn clear_through(&self, max_sequence_id: u64) {
        self.inner
            .lock()
            .unwrap()
            .operations
            .retain(|op| op.sequence_id > max_sequence_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, i64)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn preserves_order_across_kinds_and_tables() {
        let tracker = OperationTracker::new();
        tracker.log_insert("items", 1, payload(&[("qty", 1)]));
        tracker.log_update("items", 1, payload(&[("qty", 2)]));
        tracker.log_delete("orders", 9);

        let ops = tracker.pending();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].kind, OperationKind::Insert);
        assert_eq!(ops[1].kind, OperationKind::Update);
        assert_eq!(ops[2].kind, OperationKind::Delete);
        assert_eq!(ops[2].table, "orders");
        assert!(ops[0].sequence_id < ops[1].sequence_id);
        assert!(ops[1].sequence_id < ops[2].sequence_id);
    }

    #[test]
    fn clear_through_keeps_operations_logged_after_the_snapshot() {
        let tracker = OperationTracker::new();
        tracker.log_insert("items", 1, payload(&[("qty", 1)]));
        tracker.log_insert("items", 2, payload(&[("qty", 2)]));
        let snapshot = tracker.pending();
        let through = snapshot.last().unwrap().sequence_id;

        // Logged while the snapshot was being synced elsewhere.
        tracker.log_insert("items", 3, payload(&[("qty", 3)]));

        tracker.clear_through(through);
        let remaining = tracker.pending();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].local_id, 3);
    }

    #[test]
    fn clear_resets_pending_but_not_sequence() {
        let tracker = OperationTracker::new();
        tracker.log_delete("items", 1);
        assert_eq!(tracker.pending_count(), 1);

        tracker.clear();
        assert_eq!(tracker.pending_count(), 0);

        tracker.log_delete("items", 2);
        // Sequence numbers keep climbing so old operations can never be
        // confused with new ones.
        assert_eq!(tracker.pending()[0].sequence_id, 1);
    }
}
