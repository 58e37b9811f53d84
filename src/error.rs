use thiserror::Error;

use crate::types::EntityId;

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A single field-level validation failure, produced at the system boundary
/// before anything touches the change log.
#[derive(Debug, Clone, Error)]
#[error("Validation failed for \"{field}\": {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RecurrenceError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum RecurrenceError {
    /// The frequency/config combination has no defined next occurrence.
    /// Fatal to the single call, not to the app — callers flag the bill
    /// as misconfigured instead of guessing.
    #[error("Unsupported frequency: {frequency} with config \"{config_kind}\"")]
    UnsupportedFrequency {
        frequency: String,
        config_kind: String,
    },

    /// Arithmetic walked off the supported calendar range.
    #[error("Date out of range advancing from {from}")]
    DateOutOfRange { from: String },
}

// ---------------------------------------------------------------------------
// PaymentError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Invalid payment amount: {0} (must be greater than 0)")]
    InvalidAmount(f64),

    #[error("Bill {0} is archived and cannot accept payments")]
    BillArchived(EntityId),

    #[error("Bill {0} not found")]
    BillNotFound(EntityId),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// MutationError
// ---------------------------------------------------------------------------

/// Failures from the non-payment mutation surface (`mutate_bill`,
/// `delete_bill`).
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Bill {0} not found")]
    NotFound(EntityId),

    #[error("Bill {0} is archived; only un-archival is permitted")]
    ArchivedImmutable(EntityId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {entity}/{id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage corruption in {entity}/{id}: {message}")]
    Corruption {
        entity: &'static str,
        id: String,
        message: String,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

/// Error surface of the request pipeline.
///
/// `AuthExpired` is separated out so the caller can perform a token refresh
/// as an explicit awaited step and retry exactly once — no hidden retry
/// flags on request objects. Timeouts are reported as `Network`.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication expired")]
    AuthExpired,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A payment in a push referenced a bill whose create was rejected in
    /// the same push. The payment must be rolled back, never applied
    /// against a nonexistent bill.
    #[error("Payment {payment} references rejected bill {bill_ref}")]
    ReferenceIntegrity {
        payment: EntityId,
        bill_ref: EntityId,
    },
}

// ---------------------------------------------------------------------------
// BillSyncError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BillSyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias — the default error type is `BillSyncError`.
pub type Result<T, E = BillSyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
