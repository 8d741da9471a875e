//! Domain models for balance-service.

mod balance;
mod breakdown;
mod ledger;
mod price;
mod rollover;

pub use balance::{
    AggregateBalance, BalanceUpdate, BreakdownView, CheckRequest, CheckResponse, CreateGrant,
    TrackRequest,
};
pub use breakdown::{
    Breakdown, CustomerProduct, Entity, Feature, GrantScope, ProductStatus, ResetInterval,
};
pub use ledger::{BalanceDelta, BalanceKey, DeltaOp, FeatureLedger, LedgerKey};
pub use price::{
    Discount, PriceConfig, RawPriceConfig, TierBehavior, TierBound, UsagePrice, UsageTier,
};
pub use rollover::{Rollover, RolloverConfig, RolloverDuration};
