//! Balance Service - Entitlement balances and usage metering for usage-based billing.

pub mod config;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod services;
pub mod startup;
