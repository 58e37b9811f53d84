//! Delta-synchronization protocol: transport seam, conflict resolution,
//! and the reconciler that drives full/delta sync runs.

pub mod conflict;
pub mod context;
pub mod reconciler;
pub mod types;

pub use conflict::ConflictResolver;
pub use context::{SyncContext, TokenSource};
pub use reconciler::SyncReconciler;
pub use types::*;
