//! In-memory store, used by tests and as the reference implementation of
//! the `LocalStore` contract.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::changelog::{ChangeLogEntry, EntityKind, EntryKey};
use crate::error::StorageError;
use crate::types::{Bill, EntityId, Payment};

use super::traits::LocalStore;

#[derive(Default)]
struct Inner {
    bills: HashMap<EntityId, Bill>,
    payments: HashMap<EntityId, Payment>,
    changelog: Vec<ChangeLogEntry>,
    checkpoint: Option<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get_bill(&self, id: &EntityId) -> Result<Option<Bill>, StorageError> {
        Ok(self.inner.lock().bills.get(id).cloned())
    }

    fn put_bill(&self, bill: &Bill) -> Result<(), StorageError> {
        self.inner.lock().bills.insert(bill.id.clone(), bill.clone());
        Ok(())
    }

    fn remove_bill(&self, id: &EntityId) -> Result<(), StorageError> {
        self.inner.lock().bills.remove(id);
        Ok(())
    }

    fn list_bills(&self) -> Result<Vec<Bill>, StorageError> {
        let mut bills: Vec<Bill> = self.inner.lock().bills.values().cloned().collect();
        bills.sort_by(|a, b| a.next_due.cmp(&b.next_due));
        Ok(bills)
    }

    fn get_payment(&self, id: &EntityId) -> Result<Option<Payment>, StorageError> {
        Ok(self.inner.lock().payments.get(id).cloned())
    }

    fn put_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        self.inner
            .lock()
            .payments
            .insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    fn remove_payment(&self, id: &EntityId) -> Result<(), StorageError> {
        self.inner.lock().payments.remove(id);
        Ok(())
    }

    fn list_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let mut payments: Vec<Payment> = self.inner.lock().payments.values().cloned().collect();
        payments.sort_by(|a, b| a.payment_date.cmp(&b.payment_date));
        Ok(payments)
    }

    fn replace_all(
        &self,
        bills: &[Bill],
        payments: &[Payment],
        keep: &[EntryKey],
    ) -> Result<(), StorageError> {
        let kept = |kind: EntityKind, id: &EntityId| {
            keep.iter().any(|(k, kid)| *k == kind && kid == id)
        };

        let mut inner = self.inner.lock();

        inner.bills.retain(|id, _| kept(EntityKind::Bill, id));
        for bill in bills {
            if !kept(EntityKind::Bill, &bill.id) {
                inner.bills.insert(bill.id.clone(), bill.clone());
            }
        }

        inner.payments.retain(|id, _| kept(EntityKind::Payment, id));
        for payment in payments {
            if !kept(EntityKind::Payment, &payment.id) {
                inner.payments.insert(payment.id.clone(), payment.clone());
            }
        }

        Ok(())
    }

    fn load_changelog(&self) -> Result<Vec<ChangeLogEntry>, StorageError> {
        Ok(self.inner.lock().changelog.clone())
    }

    fn save_changelog(&self, entries: &[ChangeLogEntry]) -> Result<(), StorageError> {
        self.inner.lock().changelog = entries.to_vec();
        Ok(())
    }

    fn checkpoint(&self) -> Result<Option<String>, StorageError> {
        Ok(self.inner.lock().checkpoint.clone())
    }

    fn set_checkpoint(&self, server_time: &str) -> Result<(), StorageError> {
        self.inner.lock().checkpoint = Some(server_time.to_string());
        Ok(())
    }
}
