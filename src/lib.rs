pub mod error;
pub mod types;

pub mod changelog;
pub mod engine;
pub mod payment;
pub mod recurrence;
pub mod storage;
pub mod sync;
pub mod validate;

pub use engine::{BillEngine, NewBill};
pub use error::{BillSyncError, Result};
pub use types::{Bill, BillKind, EntityId, Frequency, FrequencyConfig, Payment};
