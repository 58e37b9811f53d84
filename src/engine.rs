//! BillEngine — the application-facing surface.
//!
//! Every mutation follows the same shape: validate at the boundary, apply
//! to local storage, queue the change, persist the queue. The change log
//! write happens only after validation succeeds, so a rejected input never
//! leaves partial state. Sync is delegated to the [`SyncReconciler`], which
//! shares the store and change log.

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::Value;

use crate::changelog::{ChangeLog, EntityKind, Operation};
use crate::error::{MutationError, PaymentError, Result, StorageError};
use crate::payment::{apply_payment, PaymentInput, PaymentOutcome};
use crate::storage::LocalStore;
use crate::sync::{
    PayRequest, SyncContext, SyncMode, SyncPhase, SyncReconciler, SyncReport, SyncTransport,
    TokenSource,
};
use crate::types::{Bill, BillKind, EntityId, Frequency, FrequencyConfig, Payment};
use crate::validate;

// ============================================================================
// NewBill
// ============================================================================

/// Draft for a bill created on this device. The engine assigns the client
/// ref; the server assigns the permanent id on first push.
#[derive(Debug, Clone)]
pub struct NewBill {
    pub name: String,
    pub amount: Option<f64>,
    pub avg_amount: Option<f64>,
    pub varies: bool,
    pub kind: BillKind,
    pub frequency: Frequency,
    pub frequency_config: FrequencyConfig,
    pub next_due: NaiveDate,
    pub auto_payment: bool,
    pub account: Option<String>,
    pub notes: Option<String>,
}

// ============================================================================
// BillEngine
// ============================================================================

pub struct BillEngine {
    store: Arc<dyn LocalStore>,
    changelog: Arc<Mutex<ChangeLog>>,
    reconciler: SyncReconciler,
}

impl BillEngine {
    /// Open the engine over a store, restoring any change log persisted by
    /// a previous session.
    pub fn new(
        store: Arc<dyn LocalStore>,
        transport: Arc<dyn SyncTransport>,
        ctx: SyncContext,
    ) -> Result<Self, StorageError> {
        let entries = store.load_changelog()?;
        let changelog = Arc::new(Mutex::new(ChangeLog::from_entries(entries)));
        let reconciler =
            SyncReconciler::new(transport, store.clone(), changelog.clone(), ctx);
        Ok(Self {
            store,
            changelog,
            reconciler,
        })
    }

    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.reconciler = self.reconciler.with_token_source(source);
        self
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn bills(&self) -> Result<Vec<Bill>, StorageError> {
        self.store.list_bills()
    }

    pub fn get_bill(&self, id: &EntityId) -> Result<Option<Bill>, StorageError> {
        self.store.get_bill(id)
    }

    pub fn payments(&self) -> Result<Vec<Payment>, StorageError> {
        self.store.list_payments()
    }

    pub fn payments_for_bill(&self, bill_id: &EntityId) -> Result<Vec<Payment>, StorageError> {
        Ok(self
            .store
            .list_payments()?
            .into_iter()
            .filter(|p| p.bill_id == *bill_id)
            .collect())
    }

    /// Number of local mutations not yet confirmed by the server.
    pub fn pending_changes(&self) -> usize {
        self.changelog.lock().len()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn create_bill(&self, draft: NewBill) -> Result<Bill> {
        validate::validate_bill_name(&draft.name)?;
        validate::validate_amount(draft.amount)?;
        validate::validate_amount(draft.avg_amount)?;
        validate::validate_frequency(draft.frequency, &draft.frequency_config)?;
        validate::validate_date(draft.next_due, "next_due")?;

        let bill = Bill {
            id: EntityId::new_client_ref(),
            name: draft.name.trim().to_string(),
            amount: draft.amount,
            avg_amount: draft.avg_amount,
            varies: draft.varies,
            kind: draft.kind,
            frequency: draft.frequency,
            frequency_config: draft.frequency_config,
            next_due: draft.next_due,
            auto_payment: draft.auto_payment,
            account: draft.account,
            notes: draft.notes,
            archived: false,
            last_updated: None,
        };

        let payload = serde_json::to_value(&bill).map_err(StorageError::from)?;
        self.store.put_bill(&bill).map_err(MutationError::from)?;
        self.changelog.lock().record(
            EntityKind::Bill,
            bill.id.clone(),
            Operation::Create,
            payload,
            None,
        );
        self.persist_changelog()?;
        tracing::debug!(id = %bill.id, name = %bill.name, "bill created");
        Ok(bill)
    }

    /// Apply a field patch to a bill. Archived bills accept only
    /// un-archival; everything else on them is immutable. `id` and
    /// `last_updated` are server-owned and stripped: a patch can never
    /// re-key a record.
    pub fn mutate_bill(&self, id: &EntityId, mut patch: Value) -> Result<Bill> {
        if let Some(obj) = patch.as_object_mut() {
            obj.remove("id");
            obj.remove("last_updated");
        }
        let current = self
            .store
            .get_bill(id)
            .map_err(MutationError::from)?
            .ok_or_else(|| MutationError::NotFound(id.clone()))?;

        let unarchiving = patch.get("archived").and_then(Value::as_bool) == Some(false);
        if current.archived && !unarchiving {
            return Err(MutationError::ArchivedImmutable(id.clone()).into());
        }

        let prior = serde_json::to_value(&current).map_err(StorageError::from)?;
        let mut merged = prior.clone();
        merge_patch(&mut merged, &patch);
        let updated = validate::bill_from_wire(merged).map_err(MutationError::from)?;

        validate::validate_bill_name(&updated.name)?;
        validate::validate_amount(updated.amount)?;
        validate::validate_frequency(updated.frequency, &updated.frequency_config)?;
        validate::validate_date(updated.next_due, "next_due")?;

        self.store.put_bill(&updated).map_err(MutationError::from)?;
        self.changelog.lock().record(
            EntityKind::Bill,
            id.clone(),
            Operation::Update,
            patch,
            Some(prior),
        );
        self.persist_changelog()?;
        Ok(updated)
    }

    /// Delete a bill. Server-known bills archive (history stays intact,
    /// payment records remain valid); a bill that never reached the server
    /// vanishes along with its queued payments.
    pub fn delete_bill(&self, id: &EntityId) -> Result<()> {
        let bill = self
            .store
            .get_bill(id)
            .map_err(MutationError::from)?
            .ok_or_else(|| MutationError::NotFound(id.clone()))?;

        if id.is_client() {
            for payment in self.store.list_payments().map_err(MutationError::from)? {
                if payment.bill_id == *id {
                    self.store
                        .remove_payment(&payment.id)
                        .map_err(MutationError::from)?;
                    self.changelog.lock().record(
                        EntityKind::Payment,
                        payment.id,
                        Operation::Delete,
                        Value::Null,
                        None,
                    );
                }
            }
            self.store.remove_bill(id).map_err(MutationError::from)?;
            self.changelog.lock().record(
                EntityKind::Bill,
                id.clone(),
                Operation::Delete,
                Value::Null,
                None,
            );
        } else {
            let prior = serde_json::to_value(&bill).map_err(StorageError::from)?;
            let mut archived = bill;
            archived.archived = true;
            self.store.put_bill(&archived).map_err(MutationError::from)?;
            self.changelog.lock().record(
                EntityKind::Bill,
                id.clone(),
                Operation::Update,
                serde_json::json!({ "archived": true }),
                Some(prior),
            );
        }
        self.persist_changelog()?;
        tracing::debug!(%id, "bill deleted");
        Ok(())
    }

    /// Record a payment offline: advance the bill and queue both records as
    /// one logical transaction.
    pub fn record_payment(
        &self,
        bill_id: &EntityId,
        input: &PaymentInput,
    ) -> Result<PaymentOutcome> {
        let bill = self
            .store
            .get_bill(bill_id)
            .map_err(StorageError::from)?
            .ok_or_else(|| PaymentError::BillNotFound(bill_id.clone()))?;

        let prior = serde_json::to_value(&bill).map_err(StorageError::from)?;
        let outcome = apply_payment(&bill, input)?;

        self.store
            .put_bill(&outcome.updated_bill)
            .map_err(StorageError::from)?;
        self.store
            .put_payment(&outcome.payment)
            .map_err(StorageError::from)?;

        let mut bill_patch = serde_json::Map::new();
        if outcome.updated_bill.next_due != bill.next_due {
            bill_patch.insert(
                "next_due".to_string(),
                Value::from(outcome.updated_bill.next_due.to_string()),
            );
        }
        if outcome.updated_bill.archived != bill.archived {
            bill_patch.insert("archived".to_string(), Value::from(true));
        }
        let payment_payload =
            serde_json::to_value(&outcome.payment).map_err(StorageError::from)?;

        self.changelog.lock().record_pair(
            (
                EntityKind::Bill,
                bill.id.clone(),
                Operation::Update,
                Value::Object(bill_patch),
                Some(prior),
            ),
            (
                EntityKind::Payment,
                outcome.payment.id.clone(),
                Operation::Create,
                payment_payload,
                None,
            ),
        );
        self.persist_changelog()?;
        tracing::debug!(bill = %bill.id, amount = input.amount, "payment recorded");
        Ok(outcome)
    }

    /// Pay through the server directly. The server applies the same
    /// recurrence rule; the local mirror is updated with the returned
    /// payment id and nothing is queued.
    pub async fn pay_online(&self, bill_id: i64, input: &PaymentInput) -> Result<Payment> {
        let key = EntityId::Server(bill_id);
        let bill = self
            .store
            .get_bill(&key)
            .map_err(StorageError::from)?
            .ok_or_else(|| PaymentError::BillNotFound(key.clone()))?;

        let request = PayRequest {
            amount: input.amount,
            payment_date: input.payment_date.to_string(),
            notes: input.notes.clone(),
        };
        let response = self.reconciler.pay_online(bill_id, &request).await?;

        let outcome = apply_payment(&bill, input)?;
        let mut payment = outcome.payment;
        payment.id = EntityId::Server(response.id);
        self.store
            .put_bill(&outcome.updated_bill)
            .map_err(StorageError::from)?;
        self.store.put_payment(&payment).map_err(StorageError::from)?;
        Ok(payment)
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    pub async fn sync(&self, mode: SyncMode) -> SyncReport {
        self.reconciler.run(mode).await
    }

    pub fn sync_phase(&self) -> SyncPhase {
        self.reconciler.phase()
    }

    pub fn sync_context(&self) -> SyncContext {
        self.reconciler.context()
    }

    pub fn set_sync_context(&self, ctx: SyncContext) {
        self.reconciler.set_context(ctx);
    }

    fn persist_changelog(&self) -> Result<(), StorageError> {
        let log = self.changelog.lock();
        self.store.save_changelog(log.entries())
    }
}

/// Shallow field patch: patched keys replace current values.
fn merge_patch(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (k, v) in patch_obj {
            base_obj.insert(k.clone(), v.clone());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BillSyncError, TransportError};
    use crate::storage::MemoryStore;
    use crate::sync::{
        DeltaSyncResponse, FullSyncResponse, PayResponse, PushRequest, PushResponse,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct OfflineTransport;

    #[async_trait]
    impl SyncTransport for OfflineTransport {
        async fn pull_full(&self, _: &SyncContext) -> Result<FullSyncResponse, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
        async fn pull_delta(
            &self,
            _: &SyncContext,
            _: &str,
        ) -> Result<DeltaSyncResponse, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
        async fn push(
            &self,
            _: &SyncContext,
            _: &PushRequest,
        ) -> Result<PushResponse, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
        async fn pay(
            &self,
            _: &SyncContext,
            _: i64,
            _: &PayRequest,
        ) -> Result<PayResponse, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
    }

    fn engine() -> BillEngine {
        BillEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(OfflineTransport),
            SyncContext::new("http://localhost", "token", "main"),
        )
        .unwrap()
    }

    fn monthly_draft(name: &str) -> NewBill {
        NewBill {
            name: name.to_string(),
            amount: Some(50.0),
            avg_amount: None,
            varies: false,
            kind: BillKind::Expense,
            frequency: Frequency::Monthly,
            frequency_config: FrequencyConfig::None,
            next_due: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            auto_payment: false,
            account: None,
            notes: None,
        }
    }

    #[test]
    fn create_bill_assigns_client_ref_and_queues_create() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Rent")).unwrap();
        assert!(bill.id.is_client());
        assert_eq!(engine.pending_changes(), 1);
        assert_eq!(engine.bills().unwrap().len(), 1);
    }

    #[test]
    fn create_bill_rejects_bad_amount_without_side_effects() {
        let engine = engine();
        let mut draft = monthly_draft("Rent");
        draft.amount = Some(-5.0);
        assert!(matches!(
            engine.create_bill(draft),
            Err(BillSyncError::Validation(_))
        ));
        assert_eq!(engine.pending_changes(), 0);
        assert!(engine.bills().unwrap().is_empty());
    }

    #[test]
    fn archived_bill_is_immutable_except_unarchival() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Rent")).unwrap();
        engine
            .mutate_bill(&bill.id, json!({"archived": true}))
            .unwrap();

        let err = engine
            .mutate_bill(&bill.id, json!({"amount": 60.0}))
            .unwrap_err();
        assert!(matches!(
            err,
            BillSyncError::Mutation(MutationError::ArchivedImmutable(_))
        ));

        let restored = engine
            .mutate_bill(&bill.id, json!({"archived": false}))
            .unwrap();
        assert!(!restored.archived);
    }

    #[test]
    fn patch_cannot_rekey_a_bill() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Rent")).unwrap();

        let updated = engine
            .mutate_bill(&bill.id, json!({"id": 999, "amount": 60.0}))
            .unwrap();

        assert_eq!(updated.id, bill.id, "id field in a patch is ignored");
        assert_eq!(updated.amount, Some(60.0));
        assert_eq!(engine.bills().unwrap().len(), 1, "no duplicate row under a new key");
        assert!(engine.get_bill(&EntityId::Server(999)).unwrap().is_none());
    }

    #[test]
    fn deleting_unsynced_bill_erases_it_and_its_queue() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Gym")).unwrap();
        engine
            .record_payment(
                &bill.id,
                &PaymentInput {
                    amount: 30.0,
                    payment_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                    notes: None,
                },
            )
            .unwrap();

        engine.delete_bill(&bill.id).unwrap();
        assert!(engine.bills().unwrap().is_empty());
        assert!(engine.payments().unwrap().is_empty());
        assert_eq!(engine.pending_changes(), 0, "creates annihilated, nothing to push");
    }

    #[test]
    fn deleting_synced_bill_archives_it() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Gym")).unwrap();
        // Simulate a synced bill by storing it under a server id.
        let mut synced = bill.clone();
        synced.id = EntityId::Server(11);
        engine.store.put_bill(&synced).unwrap();

        engine.delete_bill(&EntityId::Server(11)).unwrap();
        let stored = engine.get_bill(&EntityId::Server(11)).unwrap().unwrap();
        assert!(stored.archived);
    }

    #[test]
    fn payment_updates_bill_and_queues_two_entries() {
        let engine = engine();
        let bill = engine.create_bill(monthly_draft("Rent")).unwrap();
        let outcome = engine
            .record_payment(
                &bill.id,
                &PaymentInput {
                    amount: 50.0,
                    payment_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                    notes: None,
                },
            )
            .unwrap();

        assert_eq!(
            outcome.updated_bill.next_due,
            NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
        );
        // Bill create (payment's bill update folded in) + payment create.
        assert_eq!(engine.pending_changes(), 2);
        assert_eq!(engine.payments_for_bill(&bill.id).unwrap().len(), 1);
    }
}
