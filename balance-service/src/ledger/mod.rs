//! Balance ledger engine: grant resolution, ordering, deduction and refund,
//! direct updates and rollover carryover.
//!
//! Everything here operates on in-memory breakdowns; persistence lives in
//! [`crate::services`].

pub mod adjust;
pub mod carryover;
pub mod deduction;
pub mod ordering;
pub mod resolver;

pub use adjust::{apply_update, distribute_current, set_current, set_granted, set_granted_and_current, set_usage};
pub use carryover::{
    prune_expired, reset_breakdown, reset_carryover, reset_due, switch_carryover,
    transfer_rollovers,
};
pub use deduction::{apply_usage, UsageOutcome};
pub use ordering::{canonical_cmp, rollover_cmp, sort_canonical};
pub use resolver::resolve;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::{
        Breakdown, CustomerProduct, Feature, FeatureLedger, GrantScope, ProductStatus,
        ResetInterval,
    };
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use uuid::Uuid;

    pub fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    /// Fresh customer-scoped breakdown with its own product.
    pub fn breakdown(interval: ResetInterval, granted: i64) -> Breakdown {
        Breakdown {
            id: Uuid::new_v4(),
            customer_product_id: Uuid::new_v4(),
            feature_id: "api_calls".into(),
            scope: GrantScope::Customer,
            entity_feature_id: None,
            granted_balance: Decimal::from(granted),
            current_balance: Decimal::from(granted),
            purchased_balance: Decimal::ZERO,
            usage: Decimal::ZERO,
            overage_allowed: false,
            reset_interval: interval,
            next_reset_at: None,
            plan_id: "pro".into(),
            rollover_config: None,
            rollovers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Ledger holding `breakdowns`, each with an active product.
    pub fn ledger_with(breakdowns: Vec<Breakdown>) -> FeatureLedger {
        FeatureLedger {
            customer_id: "cus_1".into(),
            feature: Feature {
                feature_id: "api_calls".into(),
                name: "API calls".into(),
            },
            entities: Vec::new(),
            products: breakdowns
                .iter()
                .map(|b| CustomerProduct {
                    id: b.customer_product_id,
                    plan_id: b.plan_id.clone(),
                    status: ProductStatus::Active,
                    entity_id: None,
                    expires_at: None,
                })
                .collect(),
            breakdowns,
            version: 0,
        }
    }
}
