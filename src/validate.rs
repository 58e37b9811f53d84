//! Boundary validation.
//!
//! Mutations are validated here before anything touches the change log, so
//! a rejected input never leaves partial state behind. Rules mirror the
//! server's: a push that passes this layer should not bounce on validation.

use chrono::NaiveDate;
use serde_json::Value;

use crate::error::ValidationError;
use crate::types::{Frequency, FrequencyConfig};

/// Positive, at most two decimal places, capped at one billion.
/// `None` is allowed — variable bills carry no fixed amount.
pub fn validate_amount(amount: Option<f64>) -> Result<(), ValidationError> {
    let Some(a) = amount else { return Ok(()) };
    if !a.is_finite() {
        return Err(ValidationError::new("amount", "must be a valid number"));
    }
    if a <= 0.0 {
        return Err(ValidationError::new("amount", "must be greater than 0"));
    }
    if a > 1_000_000_000.0 {
        return Err(ValidationError::new("amount", "cannot exceed 1 billion"));
    }
    // Cents precision: scaling by 100 must land on a whole number.
    if (a * 100.0).round() / 100.0 != a {
        return Err(ValidationError::new(
            "amount",
            "cannot have more than 2 decimal places",
        ));
    }
    Ok(())
}

/// `YYYY-MM-DD`, bounded to 1900–2100.
pub fn validate_date(date: NaiveDate, field: &str) -> Result<(), ValidationError> {
    use chrono::Datelike;
    if date.year() < 1900 || date.year() > 2100 {
        return Err(ValidationError::new(field, "must be between 1900 and 2100"));
    }
    Ok(())
}

pub fn parse_date(raw: &str, field: &str) -> Result<NaiveDate, ValidationError> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::new(field, "must be in YYYY-MM-DD format"))?;
    validate_date(date, field)?;
    Ok(date)
}

/// Non-empty, at most 100 characters.
pub fn validate_bill_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("name", "is required"));
    }
    if trimmed.chars().count() > 100 {
        return Err(ValidationError::new("name", "must be 100 characters or less"));
    }
    Ok(())
}

/// Validate that a frequency/config pair is one the recurrence rule can
/// compute, or `once`.
pub fn validate_frequency(
    frequency: Frequency,
    config: &FrequencyConfig,
) -> Result<(), ValidationError> {
    match (frequency, config) {
        (Frequency::Once, FrequencyConfig::None) => Ok(()),
        (
            Frequency::Weekly | Frequency::BiWeekly | Frequency::Monthly | Frequency::Quarterly | Frequency::Yearly,
            FrequencyConfig::None,
        ) => Ok(()),
        (Frequency::Monthly, FrequencyConfig::SpecificDates { dates }) => {
            if dates.is_empty() {
                return Err(ValidationError::new("frequency_config", "dates must not be empty"));
            }
            if dates.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ValidationError::new(
                    "frequency_config",
                    "dates must be strictly ascending",
                ));
            }
            if dates.iter().any(|&d| !(1..=31).contains(&d)) {
                return Err(ValidationError::new("frequency_config", "dates must be 1-31"));
            }
            Ok(())
        }
        (Frequency::Custom, FrequencyConfig::MultipleWeekly { days }) => {
            if days.is_empty() {
                return Err(ValidationError::new("frequency_config", "days must not be empty"));
            }
            if days.iter().any(|&d| d > 6) {
                return Err(ValidationError::new("frequency_config", "days must be 0-6 (Mon-Sun)"));
            }
            Ok(())
        }
        (f, c) => Err(ValidationError::new(
            "frequency_config",
            format!("\"{}\" is not valid for frequency \"{}\"", c.kind_str(), f.as_str()),
        )),
    }
}

/// Convert a wire-level `frequency_config` into the tagged union.
///
/// The legacy API carried this as a JSON string next to a separate
/// `frequency_type` column; newer payloads send the tagged object directly.
/// Both are accepted here and nowhere else.
pub fn frequency_config_from_wire(
    frequency_type: Option<&str>,
    raw: &Value,
) -> Result<FrequencyConfig, ValidationError> {
    // A JSON string is the legacy encoding: parse it, then interpret.
    let parsed: Value = match raw {
        Value::String(s) if s.trim().is_empty() => Value::Null,
        Value::String(s) => serde_json::from_str(s).map_err(|e| {
            ValidationError::new("frequency_config", format!("malformed JSON string: {e}"))
        })?,
        other => other.clone(),
    };

    // Tagged-object form round-trips through serde directly.
    if parsed.get("kind").is_some() {
        return serde_json::from_value(parsed)
            .map_err(|e| ValidationError::new("frequency_config", e.to_string()));
    }

    match frequency_type {
        None | Some("") | Some("simple") | Some("none") => Ok(FrequencyConfig::None),
        Some("specific_dates") => {
            let dates = extract_u32_list(&parsed, "dates")?;
            Ok(FrequencyConfig::SpecificDates { dates })
        }
        Some("multiple_weekly") => {
            let days = extract_u32_list(&parsed, "days")?
                .into_iter()
                .map(|d| d as u8)
                .collect();
            Ok(FrequencyConfig::MultipleWeekly { days })
        }
        Some(other) => Err(ValidationError::new(
            "frequency_type",
            format!("unknown frequency type \"{other}\""),
        )),
    }
}

/// Convert a wire-level bill object into a typed [`Bill`], normalizing the
/// legacy `frequency_type`/`frequency_config` pair into the tagged union.
pub fn bill_from_wire(mut raw: Value) -> Result<crate::types::Bill, ValidationError> {
    let frequency_type = raw
        .get("frequency_type")
        .and_then(Value::as_str)
        .map(str::to_string);
    let cfg_raw = raw.get("frequency_config").cloned().unwrap_or(Value::Null);
    let config = frequency_config_from_wire(frequency_type.as_deref(), &cfg_raw)?;

    if let Some(obj) = raw.as_object_mut() {
        obj.remove("frequency_type");
        obj.insert(
            "frequency_config".to_string(),
            serde_json::to_value(&config)
                .map_err(|e| ValidationError::new("frequency_config", e.to_string()))?,
        );
    }
    serde_json::from_value(raw).map_err(|e| ValidationError::new("bill", e.to_string()))
}

/// Payments carry no loosely-typed fields; this exists for symmetry and a
/// uniform error shape at the boundary.
pub fn payment_from_wire(raw: Value) -> Result<crate::types::Payment, ValidationError> {
    serde_json::from_value(raw).map_err(|e| ValidationError::new("payment", e.to_string()))
}

fn extract_u32_list(value: &Value, key: &str) -> Result<Vec<u32>, ValidationError> {
    let list = value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::new("frequency_config", format!("missing \"{key}\" list")))?;
    list.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    ValidationError::new("frequency_config", format!("\"{key}\" must be integers"))
                })
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
