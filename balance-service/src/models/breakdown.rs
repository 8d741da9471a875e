//! Breakdown model: one grant source contributing to a feature balance.

use crate::models::{Rollover, RolloverConfig};
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reset cadence of a breakdown, ordered from finest to coarsest.
///
/// The declaration order is the deduction order; `Ord` is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetInterval {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    SemiAnnual,
    Year,
    Lifetime,
    OneOff,
}

impl ResetInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetInterval::Hour => "hour",
            ResetInterval::Day => "day",
            ResetInterval::Week => "week",
            ResetInterval::Month => "month",
            ResetInterval::Quarter => "quarter",
            ResetInterval::SemiAnnual => "semi_annual",
            ResetInterval::Year => "year",
            ResetInterval::Lifetime => "lifetime",
            ResetInterval::OneOff => "one_off",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(ResetInterval::Hour),
            "day" => Some(ResetInterval::Day),
            "week" => Some(ResetInterval::Week),
            "month" => Some(ResetInterval::Month),
            "quarter" => Some(ResetInterval::Quarter),
            "semi_annual" => Some(ResetInterval::SemiAnnual),
            "year" => Some(ResetInterval::Year),
            "lifetime" => Some(ResetInterval::Lifetime),
            "one_off" => Some(ResetInterval::OneOff),
            _ => None,
        }
    }

    /// Whether balances on this interval are restored at cycle boundaries.
    pub fn resets(&self) -> bool {
        !matches!(self, ResetInterval::Lifetime | ResetInterval::OneOff)
    }

    /// The next boundary after `from`, or `None` for non-resetting intervals.
    pub fn advance(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ResetInterval::Hour => from.checked_add_signed(Duration::hours(1)),
            ResetInterval::Day => from.checked_add_signed(Duration::days(1)),
            ResetInterval::Week => from.checked_add_signed(Duration::weeks(1)),
            ResetInterval::Month => from.checked_add_months(Months::new(1)),
            ResetInterval::Quarter => from.checked_add_months(Months::new(3)),
            ResetInterval::SemiAnnual => from.checked_add_months(Months::new(6)),
            ResetInterval::Year => from.checked_add_months(Months::new(12)),
            ResetInterval::Lifetime | ResetInterval::OneOff => None,
        }
    }
}

impl std::fmt::Display for ResetInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who a breakdown belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantScope {
    Customer,
    Entity { entity_id: String },
}

/// Lifecycle status of the customer product owning a breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    PastDue,
    Scheduled,
    Expired,
    Canceled,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Active => "active",
            ProductStatus::PastDue => "past_due",
            ProductStatus::Scheduled => "scheduled",
            ProductStatus::Expired => "expired",
            ProductStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "past_due" => ProductStatus::PastDue,
            "scheduled" => ProductStatus::Scheduled,
            "expired" => ProductStatus::Expired,
            "canceled" => ProductStatus::Canceled,
            _ => ProductStatus::Active,
        }
    }
}

/// A product (plan instance) attached to a customer or one of its entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProduct {
    pub id: Uuid,
    pub plan_id: String,
    pub status: ProductStatus,
    pub entity_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CustomerProduct {
    /// Past-due products keep their grants until the processor gives up.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, ProductStatus::Active | ProductStatus::PastDue)
            && self.expires_at.map_or(true, |at| at > now)
    }
}

/// Metered feature known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub feature_id: String,
    pub name: String,
}

/// Sub-entity of a customer (a seat, a workspace); typed by its own feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub feature_id: String,
}

/// One grant source contributing to a (customer|entity, feature) balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub id: Uuid,
    pub customer_product_id: Uuid,
    pub feature_id: String,
    pub scope: GrantScope,
    /// Restricts the entity feature type this grant applies to.
    pub entity_feature_id: Option<String>,
    pub granted_balance: Decimal,
    pub current_balance: Decimal,
    pub purchased_balance: Decimal,
    pub usage: Decimal,
    pub overage_allowed: bool,
    pub reset_interval: ResetInterval,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub plan_id: String,
    pub rollover_config: Option<RolloverConfig>,
    #[serde(default)]
    pub rollovers: Vec<Rollover>,
    pub created_at: DateTime<Utc>,
}

impl Breakdown {
    pub fn entity_id(&self) -> Option<&str> {
        match &self.scope {
            GrantScope::Customer => None,
            GrantScope::Entity { entity_id } => Some(entity_id.as_str()),
        }
    }

    /// Rollover credit that has not yet expired at `now`.
    pub fn active_rollover_balance(&self, now: DateTime<Utc>) -> Decimal {
        self.rollovers
            .iter()
            .filter(|r| r.is_active(now))
            .map(|r| r.balance)
            .sum()
    }

    /// Checks the balance invariants that must hold between mutations.
    pub fn is_consistent(&self) -> bool {
        if self.purchased_balance < Decimal::ZERO || self.current_balance < Decimal::ZERO {
            return false;
        }
        self.current_balance == self.granted_balance + self.purchased_balance - self.usage
    }
}
