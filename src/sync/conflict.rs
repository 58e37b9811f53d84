//! Conflict resolution for rejected push entries.
//!
//! Policy: when the server returns its canonical version alongside a
//! rejection, the server wins — local storage takes that version and the
//! queued mutation is discarded. Without canonical data the mutation is a
//! plain local failure: the entry is discarded and the record rolls back
//! to the last known-good copy captured when the mutation was queued.
//!
//! Each entry is attempted at most once per push; every rejection yields a
//! caller-visible [`SyncConflict`] so the surrounding application can
//! notify the user.

use serde_json::Value;

use crate::changelog::{ChangeLogEntry, EntityKind};
use crate::error::StorageError;
use crate::storage::LocalStore;
use crate::validate;

use super::types::{ConflictResolution, SyncConflict};

pub struct ConflictResolver;

impl ConflictResolver {
    /// Settle one rejected entry against local storage and produce the
    /// conflict record for the caller.
    pub fn resolve(
        store: &dyn LocalStore,
        entry: &ChangeLogEntry,
        reason: &str,
        server_data: Option<&Value>,
    ) -> Result<SyncConflict, StorageError> {
        let resolution = match server_data {
            Some(data) => {
                Self::apply_server_version(store, entry.entity, data)?;
                ConflictResolution::ServerWins
            }
            None => {
                Self::roll_back(store, entry)?;
                ConflictResolution::RolledBack
            }
        };

        Ok(SyncConflict {
            entity: entry.entity,
            key: entry.key.clone(),
            reason: reason.to_string(),
            resolution,
            rejected_payload: entry.payload.clone(),
        })
    }

    fn apply_server_version(
        store: &dyn LocalStore,
        entity: EntityKind,
        data: &Value,
    ) -> Result<(), StorageError> {
        match entity {
            EntityKind::Bill => {
                let bill = validate::bill_from_wire(data.clone()).map_err(|e| {
                    StorageError::Corruption {
                        entity: "bill",
                        id: data
                            .get("id")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        message: e.to_string(),
                    }
                })?;
                store.put_bill(&bill)
            }
            EntityKind::Payment => {
                let payment = validate::payment_from_wire(data.clone()).map_err(|e| {
                    StorageError::Corruption {
                        entity: "payment",
                        id: data
                            .get("id")
                            .map(|v| v.to_string())
                            .unwrap_or_else(|| "?".to_string()),
                        message: e.to_string(),
                    }
                })?;
                store.put_payment(&payment)
            }
        }
    }

    /// Restore the pre-mutation snapshot. A rejected create has no prior —
    /// the local record simply goes away.
    fn roll_back(store: &dyn LocalStore, entry: &ChangeLogEntry) -> Result<(), StorageError> {
        match &entry.prior {
            Some(prior) => Self::apply_server_version(store, entry.entity, prior),
            None => match entry.entity {
                EntityKind::Bill => store.remove_bill(&entry.key),
                EntityKind::Payment => store.remove_payment(&entry.key),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::Operation;
    use crate::storage::MemoryStore;
    use crate::types::EntityId;
    use serde_json::json;

    fn update_entry(id: i64, payload: Value, prior: Option<Value>) -> ChangeLogEntry {
        ChangeLogEntry {
            entity: EntityKind::Bill,
            key: EntityId::Server(id),
            op: Operation::Update,
            payload,
            prior,
            local_timestamp: 1,
        }
    }

    fn server_bill(id: i64, amount: f64, archived: bool) -> Value {
        json!({
            "id": id,
            "name": "Internet",
            "amount": amount,
            "frequency": "monthly",
            "next_due": "2024-04-01",
            "archived": archived
        })
    }

    #[test]
    fn server_data_overwrites_local() {
        let store = MemoryStore::new();
        let entry = update_entry(5, json!({"amount": 99.0}), None);

        let conflict =
            ConflictResolver::resolve(&store, &entry, "concurrently archived", Some(&server_bill(5, 60.0, true)))
                .unwrap();

        assert_eq!(conflict.resolution, ConflictResolution::ServerWins);
        let local = store.get_bill(&EntityId::Server(5)).unwrap().unwrap();
        assert!(local.archived);
        assert_eq!(local.amount, Some(60.0));
    }

    #[test]
    fn missing_server_data_rolls_back_to_prior() {
        let store = MemoryStore::new();
        let entry = update_entry(5, json!({"amount": -1.0}), Some(server_bill(5, 60.0, false)));

        let conflict =
            ConflictResolver::resolve(&store, &entry, "validation failed", None).unwrap();

        assert_eq!(conflict.resolution, ConflictResolution::RolledBack);
        assert_eq!(conflict.rejected_payload, json!({"amount": -1.0}));
        let local = store.get_bill(&EntityId::Server(5)).unwrap().unwrap();
        assert_eq!(local.amount, Some(60.0));
    }

    #[test]
    fn rejected_create_without_prior_removes_record() {
        let store = MemoryStore::new();
        let key = EntityId::Client("ref-1".into());
        let bill = validate::bill_from_wire(server_bill(0, 10.0, false)).unwrap();
        let mut bill = bill;
        bill.id = key.clone();
        store.put_bill(&bill).unwrap();

        let entry = ChangeLogEntry {
            entity: EntityKind::Bill,
            key: key.clone(),
            op: Operation::Create,
            payload: json!({"name": "Internet"}),
            prior: None,
            local_timestamp: 1,
        };
        let conflict = ConflictResolver::resolve(&store, &entry, "invalid", None).unwrap();
        assert_eq!(conflict.resolution, ConflictResolution::RolledBack);
        assert!(store.get_bill(&key).unwrap().is_none());
    }
}
