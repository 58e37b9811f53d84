//! Sync wire types and the transport trait.
//!
//! The transport collaborator owns HTTP (bearer auth, timeouts); this crate
//! owns the request/response shapes. Incoming records stay `serde_json::Value`
//! until they pass boundary validation — legacy payloads carry
//! `frequency_config` as a JSON string and are normalized in one place.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::changelog::EntityKind;
use crate::error::TransportError;
use crate::types::EntityId;

use super::context::SyncContext;

// ============================================================================
// Pull responses
// ============================================================================

/// `GET /sync/full`
#[derive(Debug, Clone, Deserialize)]
pub struct FullSyncResponse {
    #[serde(default)]
    pub bills: Vec<Value>,
    #[serde(default)]
    pub payments: Vec<Value>,
    pub server_time: String,
}

/// `GET /sync?since=<server_time>`
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaSyncResponse {
    #[serde(default)]
    pub bills: Vec<Value>,
    #[serde(default)]
    pub payments: Vec<Value>,
    pub server_time: String,
    #[serde(default)]
    pub has_more: bool,
}

// ============================================================================
// Push request / response
// ============================================================================

/// `POST /sync/push`
///
/// Record payloads are partial JSON objects. New records carry `client_ref`
/// instead of `id`; the response maps refs to server-assigned ids.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PushRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub bills: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payments: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_bills: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_payments: Vec<i64>,
}

impl PushRequest {
    pub fn is_empty(&self) -> bool {
        self.bills.is_empty()
            && self.payments.is_empty()
            && self.deleted_bills.is_empty()
            && self.deleted_payments.is_empty()
    }
}

/// Server acknowledgement for one accepted record.
#[derive(Debug, Clone, Deserialize)]
pub struct PushAck {
    pub id: i64,
    pub action: String,
    /// Present when the record was created from a client ref — the caller
    /// must rewrite every local reference before acknowledging.
    #[serde(default)]
    pub client_ref: Option<String>,
}

/// Server verdict for one rejected record.
#[derive(Debug, Clone, Deserialize)]
pub struct PushRejection {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub client_ref: Option<String>,
    pub reason: String,
    /// The server's current canonical version, when one exists. Absent for
    /// pure validation failures.
    #[serde(default)]
    pub server_data: Option<Value>,
}

impl PushRejection {
    /// The change-log key this rejection addresses.
    pub fn entry_key(&self) -> Option<EntityId> {
        match (&self.client_ref, self.id) {
            (Some(r), _) => Some(EntityId::Client(r.clone())),
            (None, Some(id)) => Some(EntityId::Server(id)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub accepted_bills: Vec<PushAck>,
    #[serde(default)]
    pub rejected_bills: Vec<PushRejection>,
    #[serde(default)]
    pub accepted_payments: Vec<PushAck>,
    #[serde(default)]
    pub rejected_payments: Vec<PushRejection>,
    pub server_time: String,
}

// ============================================================================
// Online pay endpoint
// ============================================================================

/// `POST /bills/{id}/pay` — the server-side twin of the local payment
/// applier. Offline and online paths must converge to the same bill state.
#[derive(Debug, Clone, Serialize)]
pub struct PayRequest {
    pub amount: f64,
    pub payment_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayResponse {
    pub id: i64,
}

// ============================================================================
// SyncTransport
// ============================================================================

/// Network layer for the sync endpoints. Implementations attach bearer auth
/// from the [`SyncContext`] and apply their own timeout policy; a timeout
/// surfaces as [`TransportError::Network`].
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull_full(&self, ctx: &SyncContext) -> Result<FullSyncResponse, TransportError>;

    async fn pull_delta(
        &self,
        ctx: &SyncContext,
        since: &str,
    ) -> Result<DeltaSyncResponse, TransportError>;

    async fn push(
        &self,
        ctx: &SyncContext,
        request: &PushRequest,
    ) -> Result<PushResponse, TransportError>;

    async fn pay(
        &self,
        ctx: &SyncContext,
        bill_id: i64,
        request: &PayRequest,
    ) -> Result<PayResponse, TransportError>;
}

// ============================================================================
// Run results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Delta,
}

/// Where a sync run currently is. `Idle → PullingFull|PullingDelta →
/// Pushing → Reconciling → Idle`; failures return to `Idle` without
/// advancing the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    PullingFull,
    PullingDelta,
    Pushing,
    Reconciling,
}

/// How a rejected entry was settled locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Local entity overwritten with the server's canonical version.
    ServerWins,
    /// No canonical version; local state restored to the last known-good
    /// copy and the mutation surfaced for user correction.
    RolledBack,
}

/// Caller-visible record of one rejected mutation. A first-class result
/// value, never an error: nothing in the sync core silently drops a
/// financial record.
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub entity: EntityKind,
    pub key: EntityId,
    pub reason: String,
    pub resolution: ConflictResolution,
    /// The payload that was rejected, for user-facing correction flows.
    pub rejected_payload: Value,
}

/// A sync error event — collected in `SyncReport.errors`, never thrown.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    pub phase: SyncPhase,
    pub entity: Option<EntityKind>,
    pub id: Option<EntityId>,
    pub error: String,
}

/// Aggregated result of one sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled_bills: usize,
    pub pulled_payments: usize,
    pub conflicts: Vec<SyncConflict>,
    pub errors: Vec<SyncErrorEvent>,
    /// Checkpoint after the run, when it advanced.
    pub server_time: Option<String>,
}

impl SyncReport {
    /// A run is successful when no run-level error occurred; conflicts are
    /// an expected outcome, not a failure.
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}
