//! Pure pricing computations: tier rates, proration and change previews.
//!
//! Nothing in this module touches the store or cache, so every function is
//! safe to call concurrently and repeatedly.

pub mod preview;
pub mod proration;
pub mod tiers;

pub use preview::{
    preview_plan_change, preview_quantity_change, LineDirection, LineItem, Preview, PricedItem,
};
pub use proration::{prorated_amount, proration_factor, BillingPeriod};
pub use tiers::{graduated_tier_amount, normalize_tiers, round_to_billing_units, volume_tier_amount};

use rust_decimal::{Decimal, RoundingStrategy};

/// Round a money amount to cents for output.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
