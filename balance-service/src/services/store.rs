//! Repository seams: the durable ledger store and the fast balance cache.

use crate::models::{BalanceDelta, Breakdown, CreateGrant, FeatureLedger, LedgerKey};
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::HashSet;
use uuid::Uuid;

/// Durable relational record of every ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the ledger for `key`. `None` when the customer or the feature is
    /// unknown.
    async fn load_ledger(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError>;

    /// Apply `delta` once. Returns `false` when its id was already applied.
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<bool, AppError>;

    /// The subset of `delta_ids` already applied.
    async fn applied_deltas(&self, delta_ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError>;

    /// Persist a new breakdown together with its owning product.
    async fn insert_grant(&self, grant: &CreateGrant, breakdown: &Breakdown)
        -> Result<(), AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// Fast ledger copies plus the journal of deltas not yet durable.
#[async_trait]
pub trait BalanceCache: Send + Sync {
    async fn get(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError>;

    /// Store `ledger` if the cached version still equals `expected`
    /// (`None` meaning absent) and, in the same step, journal `delta`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        expected: Option<u64>,
        ledger: &FeatureLedger,
        delta: Option<&BalanceDelta>,
    ) -> Result<bool, AppError>;

    async fn evict(&self, key: &LedgerKey) -> Result<(), AppError>;

    /// Every journaled delta, in no particular order.
    async fn journal(&self) -> Result<Vec<BalanceDelta>, AppError>;

    /// Remove a delta from the journal once it is durable.
    async fn journal_ack(&self, delta_id: Uuid) -> Result<(), AppError>;

    async fn push_dead_letter(&self, delta: &BalanceDelta) -> Result<(), AppError>;

    /// Remove and return all dead-lettered deltas.
    async fn take_dead_letters(&self) -> Result<Vec<BalanceDelta>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
