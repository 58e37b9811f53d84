//! ChangeLog: the ordered queue of not-yet-server-confirmed local mutations.
//!
//! Keyed by `(entity, id-or-client-ref)`. Consecutive updates to the same
//! record coalesce, so the queue holds at most one pending create-or-update
//! per record plus at most one delete. Entries leave the queue only through
//! explicit `acknowledge` after the server accepts or definitively rejects
//! the corresponding push.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::EntityId;

// ============================================================================
// Entry types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Bill,
    Payment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Bill => "bill",
            EntityKind::Payment => "payment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// One pending local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub entity: EntityKind,
    /// Server id, or client ref for records created offline.
    pub key: EntityId,
    pub op: Operation,
    /// Full record for creates, field patch for updates, `Null` for deletes.
    pub payload: Value,
    /// Snapshot of the record before the first queued mutation. Used to
    /// roll back a rejected edit when the server returns no canonical data.
    /// `None` for creates — rollback removes the record.
    #[serde(default)]
    pub prior: Option<Value>,
    /// Logical timestamp: monotonic per device, orders the push.
    pub local_timestamp: u64,
}

/// Queue key: one coalescing bucket per record per create-or-update,
/// deletes tracked separately.
pub type EntryKey = (EntityKind, EntityId);

// ============================================================================
// ChangeLog
// ============================================================================

#[derive(Debug, Default)]
pub struct ChangeLog {
    entries: Vec<ChangeLogEntry>,
    clock: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a queue from persisted entries, resuming the logical clock
    /// past the highest stored timestamp.
    pub fn from_entries(entries: Vec<ChangeLogEntry>) -> Self {
        let clock = entries.iter().map(|e| e.local_timestamp).max().unwrap_or(0);
        Self { entries, clock }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record a mutation. Never fails — this is the point at which offline
    /// mutations become durable.
    ///
    /// Coalescing:
    /// - update after pending create folds into the create;
    /// - update after pending update merges fields (latest values win,
    ///   earliest `local_timestamp` and `prior` are retained);
    /// - delete after an unpushed create removes both (the record never
    ///   existed server-side).
    pub fn record(&mut self, entity: EntityKind, key: EntityId, op: Operation, payload: Value, prior: Option<Value>) {
        let ts = self.tick();
        match op {
            Operation::Create => {
                self.entries.push(ChangeLogEntry {
                    entity,
                    key,
                    op,
                    payload,
                    prior: None,
                    local_timestamp: ts,
                });
            }
            Operation::Update => {
                if let Some(existing) = self.entries.iter_mut().find(|e| {
                    e.entity == entity
                        && e.key == key
                        && matches!(e.op, Operation::Create | Operation::Update)
                }) {
                    merge_fields(&mut existing.payload, &payload);
                    return;
                }
                self.entries.push(ChangeLogEntry {
                    entity,
                    key,
                    op,
                    payload,
                    prior,
                    local_timestamp: ts,
                });
            }
            Operation::Delete => {
                let had_unpushed_create = self
                    .entries
                    .iter()
                    .any(|e| e.entity == entity && e.key == key && e.op == Operation::Create);
                if had_unpushed_create {
                    self.entries.retain(|e| !(e.entity == entity && e.key == key));
                    return;
                }
                // At most one pending delete per record.
                if self
                    .entries
                    .iter()
                    .any(|e| e.entity == entity && e.key == key && e.op == Operation::Delete)
                {
                    return;
                }
                self.entries.push(ChangeLogEntry {
                    entity,
                    key,
                    op,
                    payload: Value::Null,
                    prior,
                    local_timestamp: ts,
                });
            }
        }
    }

    /// Record two mutations as one logical transaction. Both entries get
    /// consecutive timestamps; since `record` never fails, either both are
    /// queued or the caller never reached this point.
    pub fn record_pair(
        &mut self,
        first: (EntityKind, EntityId, Operation, Value, Option<Value>),
        second: (EntityKind, EntityId, Operation, Value, Option<Value>),
    ) {
        self.record(first.0, first.1, first.2, first.3, first.4);
        self.record(second.0, second.1, second.2, second.3, second.4);
    }

    /// Entries in `local_timestamp` order, for push. Does not remove them —
    /// removal is explicit via `acknowledge`, driven by push results.
    pub fn drain(&self) -> Vec<ChangeLogEntry> {
        let mut out = self.entries.clone();
        out.sort_by_key(|e| e.local_timestamp);
        out
    }

    /// Remove entries whose push was accepted or definitively rejected.
    pub fn acknowledge(&mut self, keys: &[EntryKey]) {
        self.entries
            .retain(|e| !keys.iter().any(|(k, id)| *k == e.entity && *id == e.key));
    }

    /// Whether any pending entry references the given record.
    pub fn has_pending(&self, entity: EntityKind, id: &EntityId) -> bool {
        self.entries.iter().any(|e| e.entity == entity && e.key == *id)
    }

    /// The pending create-or-update entry for a record, if any.
    pub fn pending_upsert(&self, entity: EntityKind, id: &EntityId) -> Option<&ChangeLogEntry> {
        self.entries.iter().find(|e| {
            e.entity == entity
                && e.key == *id
                && matches!(e.op, Operation::Create | Operation::Update)
        })
    }

    pub fn set_prior(&mut self, entity: EntityKind, id: &EntityId, prior: Value) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.entity == entity && e.key == *id && e.op == Operation::Update)
        {
            e.prior = Some(prior);
        }
    }

    /// Keys of every record with a pending entry.
    pub fn pending_keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|e| (e.entity, e.key.clone())).collect()
    }

    /// Rewrite a client ref to the server-assigned id: the record's own
    /// entry keys, and `bill_id` references inside queued payment payloads.
    pub fn rewrite_client_ref(&mut self, entity: EntityKind, client_ref: &str, server_id: i64) {
        let old = EntityId::Client(client_ref.to_string());
        let new = EntityId::Server(server_id);
        for e in &mut self.entries {
            if e.entity == entity && e.key == old {
                e.key = new.clone();
                if let Some(obj) = e.payload.as_object_mut() {
                    obj.insert("id".to_string(), Value::from(server_id));
                }
            }
            if entity == EntityKind::Bill && e.entity == EntityKind::Payment {
                if let Some(obj) = e.payload.as_object_mut() {
                    if obj.get("bill_id").and_then(Value::as_str) == Some(client_ref) {
                        obj.insert("bill_id".to_string(), Value::from(server_id));
                    }
                }
            }
        }
    }

    /// Snapshot for persistence.
    pub fn entries(&self) -> &[ChangeLogEntry] {
        &self.entries
    }
}

/// Shallow field merge: later values win, keys only in `base` survive.
fn merge_fields(base: &mut Value, patch: &Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_obj), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(n: i64) -> EntityId {
        EntityId::Server(n)
    }

    #[test]
    fn updates_to_same_record_coalesce() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"amount": 10.0}), Some(json!({"amount": 5.0})));
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"name": "Rent"}), None);

        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload, json!({"amount": 10.0, "name": "Rent"}));
        assert_eq!(drained[0].local_timestamp, 1, "earliest timestamp retained");
        assert_eq!(drained[0].prior, Some(json!({"amount": 5.0})));
    }

    #[test]
    fn latest_field_value_wins_in_coalesce() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"amount": 10.0}), None);
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"amount": 25.0}), None);
        assert_eq!(log.drain()[0].payload, json!({"amount": 25.0}));
    }

    #[test]
    fn update_folds_into_pending_create() {
        let mut log = ChangeLog::new();
        let key = EntityId::Client("ref-1".into());
        log.record(EntityKind::Bill, key.clone(), Operation::Create, json!({"name": "Gym"}), None);
        log.record(EntityKind::Bill, key, Operation::Update, json!({"amount": 30.0}), None);

        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].op, Operation::Create);
        assert_eq!(drained[0].payload, json!({"name": "Gym", "amount": 30.0}));
    }

    #[test]
    fn delete_annihilates_unpushed_create() {
        let mut log = ChangeLog::new();
        let key = EntityId::Client("ref-1".into());
        log.record(EntityKind::Bill, key.clone(), Operation::Create, json!({"name": "Gym"}), None);
        log.record(EntityKind::Bill, key, Operation::Delete, Value::Null, None);
        assert!(log.is_empty());
    }

    #[test]
    fn delete_on_synced_record_is_queued_once() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Payment, sid(9), Operation::Delete, Value::Null, None);
        log.record(EntityKind::Payment, sid(9), Operation::Delete, Value::Null, None);
        assert_eq!(log.len(), 1);
        assert_eq!(log.drain()[0].op, Operation::Delete);
    }

    #[test]
    fn drain_orders_by_local_timestamp() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"a": 1}), None);
        log.record(EntityKind::Payment, sid(2), Operation::Delete, Value::Null, None);
        log.record(EntityKind::Bill, sid(3), Operation::Update, json!({"b": 2}), None);

        let ts: Vec<u64> = log.drain().iter().map(|e| e.local_timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }

    #[test]
    fn drain_does_not_remove_entries() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"a": 1}), None);
        let _ = log.drain();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn acknowledge_removes_by_key() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"a": 1}), None);
        log.record(EntityKind::Payment, sid(2), Operation::Delete, Value::Null, None);

        log.acknowledge(&[(EntityKind::Bill, sid(1))]);
        assert_eq!(log.len(), 1);
        assert!(log.has_pending(EntityKind::Payment, &sid(2)));
    }

    #[test]
    fn rewrite_client_ref_touches_payment_foreign_keys() {
        let mut log = ChangeLog::new();
        let bill_ref = EntityId::Client("bill-ref".into());
        let pay_ref = EntityId::Client("pay-ref".into());
        log.record(EntityKind::Bill, bill_ref, Operation::Create, json!({"name": "Gym"}), None);
        log.record(
            EntityKind::Payment,
            pay_ref.clone(),
            Operation::Create,
            json!({"bill_id": "bill-ref", "amount": 30.0}),
            None,
        );

        log.rewrite_client_ref(EntityKind::Bill, "bill-ref", 77);

        let drained = log.drain();
        assert_eq!(drained[0].key, EntityId::Server(77));
        assert_eq!(drained[1].payload["bill_id"], json!(77));
        assert_eq!(drained[1].key, pay_ref, "payment's own ref untouched");
    }

    #[test]
    fn from_entries_resumes_the_clock() {
        let mut log = ChangeLog::new();
        log.record(EntityKind::Bill, sid(1), Operation::Update, json!({"a": 1}), None);
        log.record(EntityKind::Bill, sid(2), Operation::Update, json!({"b": 2}), None);

        let mut restored = ChangeLog::from_entries(log.drain());
        restored.record(EntityKind::Bill, sid(3), Operation::Update, json!({"c": 3}), None);
        let ts: Vec<u64> = restored.drain().iter().map(|e| e.local_timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
    }
}
