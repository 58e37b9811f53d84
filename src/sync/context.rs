//! Per-call sync context.
//!
//! The upstream client kept base URL, auth token, and active database in a
//! process-wide mutable singleton. Here the same state is an explicit value
//! handed to the reconciler, which makes multi-tenant use and testing with
//! simulated tenants straightforward.

use async_trait::async_trait;

use crate::error::TransportError;

/// Connection parameters for one tenant's sync session.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub base_url: String,
    pub bearer_token: String,
    /// Active bill group ("database" upstream) this device syncs against.
    pub tenant: String,
}

impl SyncContext {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: bearer_token.into(),
            tenant: tenant.into(),
        }
    }
}

/// Token refresh as an explicit, awaited step.
///
/// When a transport call fails with [`TransportError::AuthExpired`], the
/// reconciler refreshes through this trait and retries the call exactly
/// once. No hidden retry state lives on requests.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn refresh(&self) -> Result<String, TransportError>;
}
