//! Time-fraction proration within a billing period.

use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Billing-period boundaries as supplied by the payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, LedgerError> {
        if end <= start {
            return Err(LedgerError::validation(format!(
                "billing period end {} is not after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }
}

/// Remaining fraction of `period` at `now`, clamped to `[0, 1]`.
pub fn proration_factor(period: &BillingPeriod, now: DateTime<Utc>) -> Result<Decimal, LedgerError> {
    let total = (period.end - period.start).num_milliseconds();
    if total <= 0 {
        return Err(LedgerError::validation("billing period has no length"));
    }
    let remaining = (period.end - now).num_milliseconds();

    let factor = Decimal::from(remaining) / Decimal::from(total);
    Ok(factor.clamp(Decimal::ZERO, Decimal::ONE))
}

/// `amount` scaled by the remaining fraction of `period`.
pub fn prorated_amount(
    amount: Decimal,
    period: &BillingPeriod,
    now: DateTime<Utc>,
) -> Result<Decimal, LedgerError> {
    Ok(amount * proration_factor(period, now)?)
}
