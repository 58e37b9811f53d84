//! SyncReconciler — drives a full or delta sync run against the server.
//!
//! A run is pull, then push, then reconcile. The pull brings the local
//! store up to the server's state (merging around records with pending
//! local changes); the push sends the change log and settles every
//! acceptance and rejection; reconcile advances the checkpoint and
//! persists the surviving change log.
//!
//! `run` never returns `Err`. Every failure is collected into the
//! [`SyncReport`] so one bad record cannot abort an otherwise healthy
//! cycle, and a transport failure leaves the checkpoint untouched for the
//! next attempt. Concurrent `run` calls coalesce: while a cycle is in
//! flight, later callers wait and share its report.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::changelog::{ChangeLog, ChangeLogEntry, EntityKind, EntryKey, Operation};
use crate::error::{StorageError, SyncError, TransportError};
use crate::storage::LocalStore;
use crate::types::EntityId;
use crate::validate;

use super::conflict::ConflictResolver;
use super::context::{SyncContext, TokenSource};
use super::types::{
    PushRequest, SyncErrorEvent, SyncMode, SyncPhase, SyncReport, SyncTransport,
};

// ============================================================================
// SyncReconciler
// ============================================================================

pub struct SyncReconciler {
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn LocalStore>,
    changelog: Arc<Mutex<ChangeLog>>,
    token_source: Option<Arc<dyn TokenSource>>,
    ctx: Mutex<SyncContext>,
    phase: Mutex<SyncPhase>,
    slot: Mutex<RunSlot>,
}

/// Coalescing state: callers arriving mid-run wait on the running cycle's
/// report instead of starting a second one.
struct RunSlot {
    running: bool,
    waiters: Vec<oneshot::Sender<SyncReport>>,
}

/// Releases the run slot if the owning cycle's future is dropped mid-run.
/// Dropping the queued senders wakes every waiter with a dropped-cycle
/// report; the phase returns to idle so the next run starts clean.
struct SlotGuard<'a> {
    reconciler: &'a SyncReconciler,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("sync cycle dropped before completion");
        {
            let mut slot = self.reconciler.slot.lock();
            slot.running = false;
            slot.waiters.clear();
        }
        *self.reconciler.phase.lock() = SyncPhase::Idle;
    }
}

impl SyncReconciler {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn LocalStore>,
        changelog: Arc<Mutex<ChangeLog>>,
        ctx: SyncContext,
    ) -> Self {
        Self {
            transport,
            store,
            changelog,
            token_source: None,
            ctx: Mutex::new(ctx),
            phase: Mutex::new(SyncPhase::Idle),
            slot: Mutex::new(RunSlot {
                running: false,
                waiters: Vec::new(),
            }),
        }
    }

    /// Attach a token source; without one an `AuthExpired` is terminal for
    /// the run.
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn context(&self) -> SyncContext {
        self.ctx.lock().clone()
    }

    pub fn set_context(&self, ctx: SyncContext) {
        *self.ctx.lock() = ctx;
    }

    /// Run one sync cycle. Coalesces with an in-flight cycle.
    ///
    /// Callers may cancel by dropping the returned future; the slot guard
    /// releases the run slot on drop, so a cancelled cycle never blocks
    /// later runs. Waiters of a cancelled cycle get an error report.
    pub async fn run(&self, mode: SyncMode) -> SyncReport {
        let wait = {
            let mut slot = self.slot.lock();
            if slot.running {
                let (tx, rx) = oneshot::channel();
                slot.waiters.push(tx);
                Some(rx)
            } else {
                slot.running = true;
                None
            }
        };

        if let Some(rx) = wait {
            return match rx.await {
                Ok(report) => report,
                Err(_) => {
                    let mut report = SyncReport::default();
                    report.errors.push(SyncErrorEvent {
                        phase: SyncPhase::Idle,
                        entity: None,
                        id: None,
                        error: "sync cycle dropped before completion".to_string(),
                    });
                    report
                }
            };
        }

        let mut guard = SlotGuard {
            reconciler: self,
            armed: true,
        };
        let report = self.run_inner(mode).await;
        guard.armed = false;

        let waiters = {
            let mut slot = self.slot.lock();
            slot.running = false;
            slot.waiters.drain(..).collect::<Vec<_>>()
        };
        for tx in waiters {
            let _ = tx.send(report.clone());
        }
        report
    }

    // -----------------------------------------------------------------------
    // Cycle body
    // -----------------------------------------------------------------------

    async fn run_inner(&self, mode: SyncMode) -> SyncReport {
        let mut report = SyncReport::default();
        let _ = self.run_steps(mode, &mut report).await;
        self.set_phase(SyncPhase::Idle);
        report
    }

    async fn run_steps(&self, mode: SyncMode, report: &mut SyncReport) -> Result<(), ()> {
        // Delta with no checkpoint degrades to a full pull: there is no
        // server instant to resume from.
        let checkpoint = match self.store.checkpoint() {
            Ok(cp) => cp,
            Err(e) => {
                self.record_storage_error(report, SyncPhase::Idle, e);
                return Err(());
            }
        };

        let pull_time = match (mode, checkpoint) {
            (SyncMode::Delta, Some(since)) => self.pull_delta(report, since).await?,
            _ => self.pull_full(report).await?,
        };

        let push_time = self.push_pending(report).await?;

        self.set_phase(SyncPhase::Reconciling);
        if let Some(time) = push_time.or(pull_time) {
            if let Err(e) = self.store.set_checkpoint(&time) {
                self.record_storage_error(report, SyncPhase::Reconciling, e);
                return Err(());
            }
            report.server_time = Some(time);
        }
        let entries = self.changelog.lock().drain();
        if let Err(e) = self.store.save_changelog(&entries) {
            self.record_storage_error(report, SyncPhase::Reconciling, e);
            return Err(());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    async fn pull_full(&self, report: &mut SyncReport) -> Result<Option<String>, ()> {
        self.set_phase(SyncPhase::PullingFull);
        let transport = self.transport.clone();
        let resp = match self
            .call(move |ctx| {
                let t = transport.clone();
                async move { t.pull_full(&ctx).await }
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.record_transport_error(report, SyncPhase::PullingFull, e);
                return Err(());
            }
        };

        let mut bills = Vec::with_capacity(resp.bills.len());
        for raw in resp.bills {
            match validate::bill_from_wire(raw) {
                Ok(b) => bills.push(b),
                Err(e) => report.errors.push(SyncErrorEvent {
                    phase: SyncPhase::PullingFull,
                    entity: Some(EntityKind::Bill),
                    id: None,
                    error: e.to_string(),
                }),
            }
        }
        let mut payments = Vec::with_capacity(resp.payments.len());
        for raw in resp.payments {
            match validate::payment_from_wire(raw) {
                Ok(p) => payments.push(p),
                Err(e) => report.errors.push(SyncErrorEvent {
                    phase: SyncPhase::PullingFull,
                    entity: Some(EntityKind::Payment),
                    id: None,
                    error: e.to_string(),
                }),
            }
        }

        // Records with pending local changes are kept; the push settles them.
        let keep = self.changelog.lock().pending_keys();
        report.pulled_bills = bills.len();
        report.pulled_payments = payments.len();
        if let Err(e) = self.store.replace_all(&bills, &payments, &keep) {
            self.record_storage_error(report, SyncPhase::PullingFull, e);
            return Err(());
        }
        // Local state now equals the server's at this instant; safe to
        // checkpoint even if the push below fails.
        if let Err(e) = self.store.set_checkpoint(&resp.server_time) {
            self.record_storage_error(report, SyncPhase::PullingFull, e);
            return Err(());
        }
        Ok(Some(resp.server_time))
    }

    async fn pull_delta(
        &self,
        report: &mut SyncReport,
        mut since: String,
    ) -> Result<Option<String>, ()> {
        self.set_phase(SyncPhase::PullingDelta);
        loop {
            let transport = self.transport.clone();
            let cursor = since.clone();
            let resp = match self
                .call(move |ctx| {
                    let t = transport.clone();
                    let cursor = cursor.clone();
                    async move { t.pull_delta(&ctx, &cursor).await }
                })
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    self.record_transport_error(report, SyncPhase::PullingDelta, e);
                    return Err(());
                }
            };

            for raw in resp.bills {
                self.merge_remote(report, EntityKind::Bill, raw);
            }
            for raw in resp.payments {
                self.merge_remote(report, EntityKind::Payment, raw);
            }

            since = resp.server_time;
            if !resp.has_more {
                break;
            }
        }
        Ok(Some(since))
    }

    /// Apply one changed record from a delta page.
    ///
    /// A pending local delete wins until the push settles it. A pending
    /// upsert is overlaid on the remote version, and the remote version
    /// becomes the entry's rollback snapshot.
    fn merge_remote(&self, report: &mut SyncReport, entity: EntityKind, raw: Value) {
        let Some(id) = raw.get("id").and_then(Value::as_i64) else {
            report.errors.push(SyncErrorEvent {
                phase: SyncPhase::PullingDelta,
                entity: Some(entity),
                id: None,
                error: "record without a server id in delta response".to_string(),
            });
            return;
        };
        let key = EntityId::Server(id);

        let merged = {
            let mut log = self.changelog.lock();
            let pending_delete = log
                .entries()
                .iter()
                .any(|e| e.entity == entity && e.key == key && e.op == Operation::Delete);
            if pending_delete {
                return;
            }
            match log.pending_upsert(entity, &key) {
                Some(entry) => {
                    let mut merged = raw.clone();
                    overlay(&mut merged, &entry.payload);
                    log.set_prior(entity, &key, raw);
                    merged
                }
                None => raw,
            }
        };

        let stored = match entity {
            EntityKind::Bill => validate::bill_from_wire(merged)
                .map_err(|e| e.to_string())
                .and_then(|b| self.store.put_bill(&b).map_err(|e| e.to_string())),
            EntityKind::Payment => validate::payment_from_wire(merged)
                .map_err(|e| e.to_string())
                .and_then(|p| self.store.put_payment(&p).map_err(|e| e.to_string())),
        };
        match stored {
            Ok(()) => match entity {
                EntityKind::Bill => report.pulled_bills += 1,
                EntityKind::Payment => report.pulled_payments += 1,
            },
            Err(error) => report.errors.push(SyncErrorEvent {
                phase: SyncPhase::PullingDelta,
                entity: Some(entity),
                id: Some(key),
                error,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    async fn push_pending(&self, report: &mut SyncReport) -> Result<Option<String>, ()> {
        let entries = self.changelog.lock().drain();
        if entries.is_empty() {
            return Ok(None);
        }

        self.set_phase(SyncPhase::Pushing);
        let request = build_push_request(&entries);
        if request.is_empty() {
            return Ok(None);
        }

        let transport = self.transport.clone();
        let req = request.clone();
        let resp = match self
            .call(move |ctx| {
                let t = transport.clone();
                let req = req.clone();
                async move { t.push(&ctx, &req).await }
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                self.record_transport_error(report, SyncPhase::Pushing, e);
                return Err(());
            }
        };

        let mut acked: Vec<EntryKey> = Vec::new();

        // Acceptances. A new server id must be adopted everywhere a client
        // ref appears before the entry is acknowledged.
        for ack in &resp.accepted_bills {
            if let Some(client_ref) = &ack.client_ref {
                if let Err(e) = self.adopt_bill_id(client_ref, ack.id) {
                    self.record_storage_error(report, SyncPhase::Pushing, e);
                    continue;
                }
            }
            acked.push((EntityKind::Bill, EntityId::Server(ack.id)));
            report.pushed += 1;
        }
        for ack in &resp.accepted_payments {
            if let Some(client_ref) = &ack.client_ref {
                if let Err(e) = self.adopt_payment_id(client_ref, ack.id) {
                    self.record_storage_error(report, SyncPhase::Pushing, e);
                    continue;
                }
            }
            acked.push((EntityKind::Payment, EntityId::Server(ack.id)));
            report.pushed += 1;
        }

        // Rejections. Each one is settled locally and acknowledged so the
        // entry is never re-pushed.
        let mut rejected_bill_refs: Vec<String> = Vec::new();
        for rej in resp
            .rejected_bills
            .iter()
            .map(|r| (EntityKind::Bill, r))
            .chain(resp.rejected_payments.iter().map(|r| (EntityKind::Payment, r)))
        {
            let (entity, rej) = rej;
            let Some(key) = rej.entry_key() else {
                report.errors.push(SyncErrorEvent {
                    phase: SyncPhase::Pushing,
                    entity: Some(entity),
                    id: None,
                    error: format!("rejection without id or client_ref: {}", rej.reason),
                });
                continue;
            };
            let Some(entry) = entries.iter().find(|e| e.entity == entity && e.key == key) else {
                report.errors.push(SyncErrorEvent {
                    phase: SyncPhase::Pushing,
                    entity: Some(entity),
                    id: Some(key),
                    error: format!("rejection for unknown entry: {}", rej.reason),
                });
                continue;
            };
            match ConflictResolver::resolve(
                self.store.as_ref(),
                entry,
                &rej.reason,
                rej.server_data.as_ref(),
            ) {
                Ok(conflict) => report.conflicts.push(conflict),
                Err(e) => self.record_storage_error(report, SyncPhase::Pushing, e),
            }
            if entity == EntityKind::Bill {
                if let EntityId::Client(r) = &key {
                    rejected_bill_refs.push(r.clone());
                }
            }
            acked.push((entity, key));
        }

        // Reference integrity: a queued payment must never survive against a
        // bill whose create just bounced.
        for entry in &entries {
            if entry.entity != EntityKind::Payment {
                continue;
            }
            if acked.iter().any(|(k, id)| *k == entry.entity && *id == entry.key) {
                continue;
            }
            let Some(bill_ref) = entry.payload.get("bill_id").and_then(Value::as_str) else {
                continue;
            };
            if !rejected_bill_refs.iter().any(|r| r == bill_ref) {
                continue;
            }
            let reason = SyncError::ReferenceIntegrity {
                payment: entry.key.clone(),
                bill_ref: EntityId::Client(bill_ref.to_string()),
            }
            .to_string();
            match ConflictResolver::resolve(self.store.as_ref(), entry, &reason, None) {
                Ok(conflict) => report.conflicts.push(conflict),
                Err(e) => self.record_storage_error(report, SyncPhase::Pushing, e),
            }
            acked.push((entry.entity, entry.key.clone()));
        }

        // Accepted deletes come back as plain acks; their entries were
        // matched by server id above. Remaining delete entries whose ids the
        // server confirmed are covered by the same keys.
        self.changelog.lock().acknowledge(&acked);
        Ok(Some(resp.server_time))
    }

    /// Rewrite a freshly assigned bill id: the stored bill, stored payments
    /// referencing it, and every queued entry.
    fn adopt_bill_id(&self, client_ref: &str, server_id: i64) -> Result<(), StorageError> {
        let old = EntityId::Client(client_ref.to_string());
        if let Some(mut bill) = self.store.get_bill(&old)? {
            self.store.remove_bill(&old)?;
            bill.id = EntityId::Server(server_id);
            self.store.put_bill(&bill)?;
        }
        for mut payment in self.store.list_payments()? {
            if payment.bill_id == old {
                payment.bill_id = EntityId::Server(server_id);
                self.store.put_payment(&payment)?;
            }
        }
        self.changelog
            .lock()
            .rewrite_client_ref(EntityKind::Bill, client_ref, server_id);
        Ok(())
    }

    fn adopt_payment_id(&self, client_ref: &str, server_id: i64) -> Result<(), StorageError> {
        let old = EntityId::Client(client_ref.to_string());
        if let Some(mut payment) = self.store.get_payment(&old)? {
            self.store.remove_payment(&old)?;
            payment.id = EntityId::Server(server_id);
            self.store.put_payment(&payment)?;
        }
        self.changelog
            .lock()
            .rewrite_client_ref(EntityKind::Payment, client_ref, server_id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Online pay
    // -----------------------------------------------------------------------

    /// Direct `POST /bills/{id}/pay` against the server, with the same
    /// auth-refresh-and-retry behavior as the sync endpoints.
    pub async fn pay_online(
        &self,
        bill_id: i64,
        request: &super::types::PayRequest,
    ) -> Result<super::types::PayResponse, TransportError> {
        let transport = self.transport.clone();
        let req = request.clone();
        self.call(move |ctx| {
            let t = transport.clone();
            let req = req.clone();
            async move { t.pay(&ctx, bill_id, &req).await }
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Transport plumbing
    // -----------------------------------------------------------------------

    /// Invoke a transport call with the current context. On `AuthExpired`,
    /// refresh the token through the [`TokenSource`] and retry exactly once.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: Fn(SyncContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let ctx = self.ctx.lock().clone();
        let first = op(ctx).await;
        if !matches!(first, Err(TransportError::AuthExpired)) {
            return first;
        }
        let Some(source) = &self.token_source else {
            return first;
        };
        let token = source.refresh().await?;
        let retry_ctx = {
            let mut ctx = self.ctx.lock();
            ctx.bearer_token = token;
            ctx.clone()
        };
        op(retry_ctx).await
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock() = phase;
        tracing::debug!(?phase, "sync phase");
    }

    fn record_transport_error(
        &self,
        report: &mut SyncReport,
        phase: SyncPhase,
        error: TransportError,
    ) {
        tracing::warn!(?phase, %error, "sync transport failure");
        report.errors.push(SyncErrorEvent {
            phase,
            entity: None,
            id: None,
            error: error.to_string(),
        });
    }

    fn record_storage_error(&self, report: &mut SyncReport, phase: SyncPhase, error: StorageError) {
        tracing::warn!(?phase, %error, "sync storage failure");
        report.errors.push(SyncErrorEvent {
            phase,
            entity: None,
            id: None,
            error: error.to_string(),
        });
    }
}

// ============================================================================
// Push assembly
// ============================================================================

/// Build the wire request from drained entries. Creates carry `client_ref`,
/// updates carry `id`, deletes of synced records go into the deleted lists.
/// A delete of a never-pushed record cannot appear here: the change log
/// annihilates the create instead.
fn build_push_request(entries: &[ChangeLogEntry]) -> PushRequest {
    let mut request = PushRequest::default();
    for entry in entries {
        match entry.op {
            Operation::Create | Operation::Update => {
                let mut payload = entry.payload.clone();
                if let Some(obj) = payload.as_object_mut() {
                    match &entry.key {
                        EntityId::Client(r) => {
                            obj.remove("id");
                            obj.insert("client_ref".to_string(), Value::from(r.clone()));
                        }
                        EntityId::Server(id) => {
                            obj.insert("id".to_string(), Value::from(*id));
                        }
                    }
                }
                match entry.entity {
                    EntityKind::Bill => request.bills.push(payload),
                    EntityKind::Payment => request.payments.push(payload),
                }
            }
            Operation::Delete => {
                if let Some(id) = entry.key.as_server() {
                    match entry.entity {
                        EntityKind::Bill => request.deleted_bills.push(id),
                        EntityKind::Payment => request.deleted_payments.push(id),
                    }
                }
            }
        }
    }
    request
}

/// Shallow overlay: patch fields replace remote fields.
fn overlay(base: &mut Value, patch: &Value) {
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
    use serde_json::json;

    fn entry(
        entity: EntityKind,
        key: EntityId,
        op: Operation,
        payload: Value,
        ts: u64,
    ) -> ChangeLogEntry {
        ChangeLogEntry {
            entity,
            key,
            op,
            payload,
            prior: None,
            local_timestamp: ts,
        }
    }

    #[test]
    fn push_request_separates_creates_updates_deletes() {
        let entries = vec![
            entry(
                EntityKind::Bill,
                EntityId::Client("ref-1".into()),
                Operation::Create,
                json!({"name": "Gym", "amount": 30.0}),
                1,
            ),
            entry(
                EntityKind::Bill,
                EntityId::Server(4),
                Operation::Update,
                json!({"amount": 45.0}),
                2,
            ),
            entry(EntityKind::Payment, EntityId::Server(9), Operation::Delete, Value::Null, 3),
        ];

        let req = build_push_request(&entries);
        assert_eq!(req.bills.len(), 2);
        assert_eq!(req.bills[0]["client_ref"], json!("ref-1"));
        assert!(req.bills[0].get("id").is_none());
        assert_eq!(req.bills[1]["id"], json!(4));
        assert_eq!(req.deleted_payments, vec![9]);
        assert!(req.deleted_bills.is_empty());
    }

    #[test]
    fn overlay_keeps_unpatched_remote_fields() {
        let mut base = json!({"id": 4, "amount": 10.0, "name": "Rent"});
        overlay(&mut base, &json!({"amount": 12.5}));
        assert_eq!(base, json!({"id": 4, "amount": 12.5, "name": "Rent"}));
    }
}
