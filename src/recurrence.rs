//! Recurrence rule: compute the next due date from a bill's frequency.
//!
//! Pure and deterministic — repeated calls with the same inputs always
//! return the same date. Sync reconciliation replays payments against
//! server state and depends on that.

use chrono::{Datelike, Days, Months, NaiveDate};

use crate::error::RecurrenceError;
use crate::types::{Frequency, FrequencyConfig};

/// Compute the next occurrence of a bill strictly after `current`.
///
/// Rules:
/// - `weekly` / `bi-weekly`: add 7 / 14 days.
/// - `monthly` (no config): add one calendar month, clamping the day to the
///   last valid day of the target month (Jan 31 → Feb 28/29).
/// - `monthly` + `specific_dates`: smallest configured day strictly after
///   the current day within this month, else the smallest configured day
///   next month; days beyond the month's end clamp to its last day.
/// - `quarterly`: add three months with the same clamp.
/// - `yearly`: add one year; Feb 29 rolls to Feb 28 off leap years.
/// - `custom` + `multiple_weekly`: next date whose weekday (Mon=0 … Sun=6)
///   is the smallest configured value after the current weekday, wrapping
///   into the following week.
///
/// Every other combination is an error — callers must not silently guess.
pub fn next_occurrence(
    current: NaiveDate,
    frequency: Frequency,
    config: &FrequencyConfig,
) -> Result<NaiveDate, RecurrenceError> {
    match (frequency, config) {
        (Frequency::Weekly, FrequencyConfig::None) => add_days(current, 7),
        (Frequency::BiWeekly, FrequencyConfig::None) => add_days(current, 14),
        (Frequency::Monthly, FrequencyConfig::None) => add_months(current, 1),
        (Frequency::Monthly, FrequencyConfig::SpecificDates { dates }) if !dates.is_empty() => {
            next_specific_date(current, dates)
        }
        (Frequency::Quarterly, FrequencyConfig::None) => add_months(current, 3),
        (Frequency::Yearly, FrequencyConfig::None) => add_months(current, 12),
        (Frequency::Custom, FrequencyConfig::MultipleWeekly { days }) if !days.is_empty() => {
            next_weekday(current, days)
        }
        (frequency, config) => Err(RecurrenceError::UnsupportedFrequency {
            frequency: frequency.as_str().to_string(),
            config_kind: config.kind_str().to_string(),
        }),
    }
}

fn add_days(current: NaiveDate, days: u64) -> Result<NaiveDate, RecurrenceError> {
    current
        .checked_add_days(Days::new(days))
        .ok_or_else(|| out_of_range(current))
}

/// `checked_add_months` clamps the day-of-month to the last valid day of
/// the target month, which is exactly the contract here.
fn add_months(current: NaiveDate, months: u32) -> Result<NaiveDate, RecurrenceError> {
    current
        .checked_add_months(Months::new(months))
        .ok_or_else(|| out_of_range(current))
}

fn next_specific_date(current: NaiveDate, dates: &[u32]) -> Result<NaiveDate, RecurrenceError> {
    // Wire payloads do not guarantee order; the scan below needs ascending.
    let mut sorted: Vec<u32> = dates.to_vec();
    sorted.sort_unstable();
    let Some(&smallest) = sorted.first() else {
        return Err(RecurrenceError::UnsupportedFrequency {
            frequency: Frequency::Monthly.as_str().to_string(),
            config_kind: "specific_dates".to_string(),
        });
    };

    // Within the current month: smallest configured day strictly after today.
    let last_day = last_day_of_month(current)?;
    for &d in &sorted {
        let day = d.min(last_day);
        if day > current.day() {
            return current
                .with_day(day)
                .ok_or_else(|| out_of_range(current));
        }
    }

    // Wrap: smallest configured day in the next month, clamped.
    let first_of_next = current
        .with_day(1)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .ok_or_else(|| out_of_range(current))?;
    let day = smallest.min(last_day_of_month(first_of_next)?);
    first_of_next
        .with_day(day)
        .ok_or_else(|| out_of_range(current))
}

fn next_weekday(current: NaiveDate, days: &[u8]) -> Result<NaiveDate, RecurrenceError> {
    let today = current.weekday().num_days_from_monday() as u8;
    let mut sorted: Vec<u8> = days.to_vec();
    sorted.sort_unstable();

    let delta = match sorted.iter().find(|&&d| d > today) {
        // Later this week.
        Some(&d) => u64::from(d - today),
        // Smallest configured weekday in the following week.
        None => 7 - u64::from(today) + u64::from(sorted[0]),
    };
    add_days(current, delta)
}

fn last_day_of_month(date: NaiveDate) -> Result<u32, RecurrenceError> {
    let first = date.with_day(1).ok_or_else(|| out_of_range(date))?;
    let next = first
        .checked_add_months(Months::new(1))
        .ok_or_else(|| out_of_range(date))?;
    Ok(next.pred_opt().ok_or_else(|| out_of_range(date))?.day())
}

fn out_of_range(from: NaiveDate) -> RecurrenceError {
    RecurrenceError::DateOutOfRange {
        from: from.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
