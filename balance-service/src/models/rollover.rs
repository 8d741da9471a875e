//! Rollover records and configuration.

use chrono::{DateTime, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unit for rollover expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverDuration {
    Month,
    Forever,
}

/// Rollover policy of a plan feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverConfig {
    /// Upper bound on carried balance; `None` carries everything.
    pub max: Option<Decimal>,
    pub length: u32,
    pub duration: RolloverDuration,
}

impl RolloverConfig {
    /// Expiry of a rollover created at `reset_at`.
    pub fn expires_at(&self, reset_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.duration {
            RolloverDuration::Forever => None,
            RolloverDuration::Month => reset_at.checked_add_months(Months::new(self.length)),
        }
    }

    /// Clamp `amount` to this policy's cap.
    pub fn cap(&self, amount: Decimal) -> Decimal {
        match self.max {
            Some(max) => amount.min(max),
            None => amount,
        }
    }
}

/// Leftover balance carried into a later cycle or destination plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollover {
    pub id: Uuid,
    pub breakdown_id: Uuid,
    pub balance: Decimal,
    pub usage: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Rollover {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}
