//! Core data model: bills, payments, frequency specifications.
//!
//! Records cross the wire as JSON; everything loosely typed in the upstream
//! API (notably `frequency_config`, historically a JSON string) is converted
//! into these types at the boundary by [`crate::validate`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// EntityId
// ============================================================================

/// Identifier for a bill or payment.
///
/// The server is the authority for id assignment. Records created offline
/// carry a client-generated ref (`Client`) until the first successful push
/// returns the permanent server id (`Server`).
///
/// Serializes untagged: server ids as JSON numbers, client refs as strings —
/// matching the wire format, where `bill_id` may be either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Server(i64),
    Client(String),
}

impl EntityId {
    /// Generate a fresh client ref for an entity created offline.
    pub fn new_client_ref() -> Self {
        EntityId::Client(Uuid::new_v4().to_string())
    }

    pub fn is_client(&self) -> bool {
        matches!(self, EntityId::Client(_))
    }

    pub fn as_server(&self) -> Option<i64> {
        match self {
            EntityId::Server(id) => Some(*id),
            EntityId::Client(_) => None,
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Server(id) => write!(f, "{id}"),
            EntityId::Client(r) => write!(f, "{r}"),
        }
    }
}

// ============================================================================
// Frequency
// ============================================================================

/// How often a bill recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Weekly,
    #[serde(rename = "bi-weekly")]
    BiWeekly,
    Monthly,
    Quarterly,
    Yearly,
    Custom,
    /// One-shot obligation: paying it archives the bill instead of
    /// advancing `next_due`.
    Once,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Weekly => "weekly",
            Frequency::BiWeekly => "bi-weekly",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::Yearly => "yearly",
            Frequency::Custom => "custom",
            Frequency::Once => "once",
        }
    }
}

/// Structured `frequency_config` payload.
///
/// The upstream client stored this as an ad hoc JSON string and re-parsed it
/// at every use. Here it is a tagged union validated once at the boundary,
/// so [`crate::recurrence`] never sees malformed config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrequencyConfig {
    #[default]
    None,
    /// Due on specific days of the month, ascending, 1–31.
    SpecificDates { dates: Vec<u32> },
    /// Due on specific weekdays, Mon=0 … Sun=6.
    MultipleWeekly { days: Vec<u8> },
}

impl FrequencyConfig {
    pub fn kind_str(&self) -> &'static str {
        match self {
            FrequencyConfig::None => "none",
            FrequencyConfig::SpecificDates { .. } => "specific_dates",
            FrequencyConfig::MultipleWeekly { .. } => "multiple_weekly",
        }
    }
}

// ============================================================================
// Bill
// ============================================================================

/// Expense or deposit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillKind {
    #[default]
    Expense,
    Deposit,
}

/// A recurring or one-time obligation or income source.
///
/// Invariants:
/// - exactly one of `amount` / `varies = true` is meaningful;
/// - `next_due` is a calendar date, never a datetime;
/// - `archived = true` bills are immutable except for un-archival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub amount: Option<f64>,
    /// Hint shown for variable bills.
    #[serde(default)]
    pub avg_amount: Option<f64>,
    #[serde(default)]
    pub varies: bool,
    #[serde(rename = "type", default)]
    pub kind: BillKind,
    pub frequency: Frequency,
    #[serde(default)]
    pub frequency_config: FrequencyConfig,
    pub next_due: NaiveDate,
    #[serde(default)]
    pub auto_payment: bool,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub archived: bool,
    /// Server-maintained modification timestamp (RFC 3339).
    #[serde(default)]
    pub last_updated: Option<String>,
}

// ============================================================================
// Payment
// ============================================================================

/// An immutable record of money moved against a bill.
///
/// `bill_id` is fixed at creation; `amount` and `payment_date` may be
/// edited afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: EntityId,
    pub bill_id: EntityId,
    pub amount: f64,
    pub payment_date: NaiveDate,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_serializes_untagged() {
        assert_eq!(serde_json::to_value(EntityId::Server(42)).unwrap(), json!(42));
        assert_eq!(
            serde_json::to_value(EntityId::Client("abc".into())).unwrap(),
            json!("abc")
        );
    }

    #[test]
    fn entity_id_deserializes_numbers_as_server() {
        let id: EntityId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(id, EntityId::Server(7));
        let id: EntityId = serde_json::from_value(json!("tmp-1")).unwrap();
        assert!(id.is_client());
    }

    #[test]
    fn frequency_round_trips_bi_weekly_spelling() {
        let f: Frequency = serde_json::from_value(json!("bi-weekly")).unwrap();
        assert_eq!(f, Frequency::BiWeekly);
        assert_eq!(serde_json::to_value(f).unwrap(), json!("bi-weekly"));
    }

    #[test]
    fn frequency_config_tagged_union() {
        let cfg: FrequencyConfig =
            serde_json::from_value(json!({"kind": "specific_dates", "dates": [1, 15]})).unwrap();
        assert_eq!(cfg, FrequencyConfig::SpecificDates { dates: vec![1, 15] });

        let none: FrequencyConfig = serde_json::from_value(json!({"kind": "none"})).unwrap();
        assert_eq!(none, FrequencyConfig::None);
    }

    #[test]
    fn bill_deserializes_with_defaults() {
        let bill: Bill = serde_json::from_value(json!({
            "id": 3,
            "name": "Rent",
            "frequency": "monthly",
            "next_due": "2024-03-01"
        }))
        .unwrap();
        assert_eq!(bill.id, EntityId::Server(3));
        assert_eq!(bill.frequency_config, FrequencyConfig::None);
        assert_eq!(bill.kind, BillKind::Expense);
        assert!(!bill.archived);
    }
}
