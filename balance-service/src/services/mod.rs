//! Services module for balance-service.

pub mod cache;
pub mod database;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod store;
pub mod sync;

pub use cache::RedisCache;
pub use database::Database;
pub use ledger::LedgerService;
pub use memory::{InMemoryCache, InMemoryStore};
pub use metrics::{get_metrics, init_metrics, record_error, record_operation};
pub use store::{BalanceCache, LedgerStore};
pub use sync::{
    BreakdownDifference, BreakdownSnapshot, ConsistencyReport, LedgerRepository, SyncWriter,
};
