//! Payment application: given a bill and a recorded payment, produce the
//! bill's next state.
//!
//! This is the client-side twin of the server's `POST /bills/{id}/pay` —
//! both must advance `next_due` through the same recurrence rule so the
//! offline and online paths converge to identical state.

use chrono::NaiveDate;

use crate::error::PaymentError;
use crate::recurrence::next_occurrence;
use crate::types::{Bill, EntityId, Frequency, Payment};
use crate::validate;

/// Input for a new payment against a bill.
#[derive(Debug, Clone)]
pub struct PaymentInput {
    pub amount: f64,
    pub payment_date: NaiveDate,
    pub notes: Option<String>,
}

/// Result of applying a payment: the bill's next state plus the new
/// payment record (carrying a fresh client ref until the server assigns
/// an id).
#[derive(Debug, Clone)]
pub struct PaymentOutcome {
    pub updated_bill: Bill,
    pub payment: Payment,
}

/// Apply a payment to a bill.
///
/// Pure with respect to storage: the caller queues the resulting bill
/// update and payment create as one logical transaction. Validation runs
/// first, so a rejected amount never produces partial state.
///
/// - `once` bills archive instead of advancing `next_due`;
/// - every other frequency advances `next_due` via the recurrence rule;
/// - all other bill fields pass through unchanged.
pub fn apply_payment(bill: &Bill, input: &PaymentInput) -> Result<PaymentOutcome, PaymentError> {
    if input.amount <= 0.0 || !input.amount.is_finite() {
        return Err(PaymentError::InvalidAmount(input.amount));
    }
    validate::validate_amount(Some(input.amount))?;
    validate::validate_date(input.payment_date, "payment_date")?;

    if bill.archived {
        return Err(PaymentError::BillArchived(bill.id.clone()));
    }

    let mut updated = bill.clone();
    if bill.frequency == Frequency::Once {
        updated.archived = true;
    } else {
        updated.next_due = next_occurrence(bill.next_due, bill.frequency, &bill.frequency_config)?;
    }

    let payment = Payment {
        id: EntityId::new_client_ref(),
        bill_id: bill.id.clone(),
        amount: input.amount,
        payment_date: input.payment_date,
        notes: input.notes.clone(),
        created_at: None,
        updated_at: None,
    };

    Ok(PaymentOutcome {
        updated_bill: updated,
        payment,
    })
}

// ============================================================================
// Tests
// ============================================================================
