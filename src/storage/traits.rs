//! Local persistence seam.
//!
//! The engine owns the shape of the persisted state — bill table, payment
//! table, change log, single-row checkpoint — while the backing store is a
//! collaborator behind this trait. All methods are synchronous; callers in
//! async contexts should expect them to block briefly.

use crate::changelog::{ChangeLogEntry, EntryKey};
use crate::error::StorageError;
use crate::types::{Bill, EntityId, Payment};

pub trait LocalStore: Send + Sync {
    fn get_bill(&self, id: &EntityId) -> Result<Option<Bill>, StorageError>;
    fn put_bill(&self, bill: &Bill) -> Result<(), StorageError>;
    fn remove_bill(&self, id: &EntityId) -> Result<(), StorageError>;
    fn list_bills(&self) -> Result<Vec<Bill>, StorageError>;

    fn get_payment(&self, id: &EntityId) -> Result<Option<Payment>, StorageError>;
    fn put_payment(&self, payment: &Payment) -> Result<(), StorageError>;
    fn remove_payment(&self, id: &EntityId) -> Result<(), StorageError>;
    fn list_payments(&self) -> Result<Vec<Payment>, StorageError>;

    /// Full-sync replacement: swap local state for the authoritative set,
    /// preserving any record whose key appears in `keep` (records with
    /// pending local changes are merged on the next push, not overwritten).
    fn replace_all(
        &self,
        bills: &[Bill],
        payments: &[Payment],
        keep: &[EntryKey],
    ) -> Result<(), StorageError>;

    fn load_changelog(&self) -> Result<Vec<ChangeLogEntry>, StorageError>;
    fn save_changelog(&self, entries: &[ChangeLogEntry]) -> Result<(), StorageError>;

    /// Last server-confirmed sync instant, if a sync has ever completed.
    fn checkpoint(&self) -> Result<Option<String>, StorageError>;
    fn set_checkpoint(&self, server_time: &str) -> Result<(), StorageError>;
}
