//! Request and response shapes of the ledger API.

use crate::models::{Breakdown, CustomerProduct, GrantScope, ResetInterval, RolloverConfig};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate balance over a resolved set of breakdowns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBalance {
    pub granted_balance: Decimal,
    pub current_balance: Decimal,
    pub purchased_balance: Decimal,
    pub usage: Decimal,
    /// Unexpired rollover credit, reported separately from `current_balance`.
    pub rollover_balance: Decimal,
}

impl AggregateBalance {
    pub fn from_breakdowns(breakdowns: &[Breakdown], now: DateTime<Utc>) -> Self {
        breakdowns.iter().fold(Self::default(), |mut acc, b| {
            acc.granted_balance += b.granted_balance;
            acc.current_balance += b.current_balance;
            acc.purchased_balance += b.purchased_balance;
            acc.usage += b.usage;
            acc.rollover_balance += b.active_rollover_balance(now);
            acc
        })
    }

    /// Balance a caller can still consume before overage.
    pub fn available(&self) -> Decimal {
        self.current_balance + self.rollover_balance
    }
}

/// Breakdown as returned by check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownView {
    pub id: Uuid,
    pub granted_balance: Decimal,
    pub current_balance: Decimal,
    pub purchased_balance: Decimal,
    pub usage: Decimal,
    pub overage_allowed: bool,
    pub reset_interval: ResetInterval,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub plan_id: String,
    pub rollover_balance: Decimal,
}

impl BreakdownView {
    pub fn from_breakdown(b: &Breakdown, now: DateTime<Utc>) -> Self {
        Self {
            id: b.id,
            granted_balance: b.granted_balance,
            current_balance: b.current_balance,
            purchased_balance: b.purchased_balance,
            usage: b.usage,
            overage_allowed: b.overage_allowed,
            reset_interval: b.reset_interval,
            next_reset_at: b.next_reset_at,
            plan_id: b.plan_id.clone(),
            rollover_balance: b.active_rollover_balance(now),
        }
    }
}

/// Usage event. A negative `value` is a refund; an omitted one counts as 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackRequest {
    pub customer_id: String,
    pub feature_id: String,
    pub entity_id: Option<String>,
    pub value: Option<Decimal>,
    pub properties: Option<serde_json::Value>,
}

impl TrackRequest {
    pub fn new(customer_id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            feature_id: feature_id.into(),
            entity_id: None,
            value: None,
            properties: None,
        }
    }

    pub fn value(mut self, value: Decimal) -> Self {
        self.value = Some(value);
        self
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Explicit balance set. Any subset of fields may be supplied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceUpdate {
    pub customer_id: String,
    pub feature_id: String,
    pub entity_id: Option<String>,
    pub current_balance: Option<Decimal>,
    pub granted_balance: Option<Decimal>,
    pub usage: Option<Decimal>,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub interval_filter: Option<ResetInterval>,
    pub breakdown_id: Option<Uuid>,
}

/// Read request; `bypass_cache` forces a durable-store read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub customer_id: String,
    pub feature_id: String,
    pub entity_id: Option<String>,
    #[serde(default)]
    pub bypass_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub balance: AggregateBalance,
    pub breakdowns: Vec<BreakdownView>,
}

/// New breakdown for an attached product or a prepaid purchase.
///
/// The owning product is upserted alongside the breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGrant {
    pub customer_id: String,
    pub feature_id: String,
    pub product: CustomerProduct,
    pub scope: GrantScope,
    pub entity_feature_id: Option<String>,
    pub granted_balance: Decimal,
    pub overage_allowed: bool,
    pub reset_interval: ResetInterval,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub rollover_config: Option<RolloverConfig>,
}

impl CreateGrant {
    pub fn to_breakdown(&self, now: DateTime<Utc>) -> Breakdown {
        // A negative allowance starts as overage with current at zero.
        let current = self.granted_balance.max(Decimal::ZERO);
        Breakdown {
            id: Uuid::new_v4(),
            customer_product_id: self.product.id,
            feature_id: self.feature_id.clone(),
            scope: self.scope.clone(),
            entity_feature_id: self.entity_feature_id.clone(),
            granted_balance: self.granted_balance,
            current_balance: current,
            purchased_balance: current - self.granted_balance,
            usage: Decimal::ZERO,
            overage_allowed: self.overage_allowed,
            reset_interval: self.reset_interval,
            next_reset_at: self.next_reset_at,
            plan_id: self.product.plan_id.clone(),
            rollover_config: self.rollover_config.clone(),
            rollovers: Vec::new(),
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductStatus;

    fn grant(granted: i64, overage_allowed: bool) -> CreateGrant {
        CreateGrant {
            customer_id: "cus_1".into(),
            feature_id: "api_calls".into(),
            product: CustomerProduct {
                id: Uuid::new_v4(),
                plan_id: "pro".into(),
                status: ProductStatus::Active,
                entity_id: None,
                expires_at: None,
            },
            scope: GrantScope::Customer,
            entity_feature_id: None,
            granted_balance: Decimal::from(granted),
            overage_allowed,
            reset_interval: ResetInterval::Month,
            next_reset_at: None,
            rollover_config: None,
        }
    }

    #[test]
    fn test_grant_starts_full() {
        let b = grant(100, false).to_breakdown(Utc::now());
        assert_eq!(b.current_balance, Decimal::from(100));
        assert_eq!(b.purchased_balance, Decimal::ZERO);
        assert!(b.is_consistent());
    }

    #[test]
    fn test_negative_grant_starts_in_overage() {
        let b = grant(-25, true).to_breakdown(Utc::now());
        assert_eq!(b.granted_balance, Decimal::from(-25));
        assert_eq!(b.current_balance, Decimal::ZERO);
        assert_eq!(b.purchased_balance, Decimal::from(25));
        assert_eq!(b.usage, Decimal::ZERO);
        assert!(b.is_consistent());
    }
}
