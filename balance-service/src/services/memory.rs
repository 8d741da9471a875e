//! In-process store and cache used by tests and local runs.

use crate::models::{BalanceDelta, Breakdown, CreateGrant, FeatureLedger, LedgerKey};
use crate::services::store::{BalanceCache, LedgerStore};
use async_trait::async_trait;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

fn poisoned(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::InternalError(anyhow::anyhow!("{} mutex poisoned: {}", what, e))
}

/// Durable-store stand-in with failure injection for delta writes.
#[derive(Default)]
pub struct InMemoryStore {
    ledgers: Mutex<HashMap<LedgerKey, FeatureLedger>>,
    applied: Mutex<HashSet<Uuid>>,
    failures_left: AtomicU32,
    fail_always: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, ledger: FeatureLedger) -> Result<(), AppError> {
        self.ledgers
            .lock()
            .map_err(|e| poisoned("store", e))?
            .insert(ledger.key(), ledger);
        Ok(())
    }

    /// Fail the next `n` delta writes with a transient database error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Fail every delta write until switched off.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_always.store(unavailable, Ordering::SeqCst);
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().map(|a| a.len()).unwrap_or_default()
    }

    fn injected_failure(&self) -> Option<AppError> {
        if self.fail_always.load(Ordering::SeqCst) {
            return Some(AppError::DatabaseError(anyhow::anyhow!("store unavailable")));
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| AppError::DatabaseError(anyhow::anyhow!("injected write failure")))
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn load_ledger(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError> {
        Ok(self
            .ledgers
            .lock()
            .map_err(|e| poisoned("store", e))?
            .get(key)
            .cloned())
    }

    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<bool, AppError> {
        if let Some(e) = self.injected_failure() {
            return Err(e);
        }

        let mut applied = self.applied.lock().map_err(|e| poisoned("applied", e))?;
        if applied.contains(&delta.delta_id) {
            return Ok(false);
        }

        let mut ledgers = self.ledgers.lock().map_err(|e| poisoned("store", e))?;
        if let Some(ledger) = ledgers.get_mut(&delta.key) {
            let skipped = ledger.apply_ops(&delta.ops);
            if skipped > 0 {
                tracing::warn!(
                    delta_id = %delta.delta_id,
                    skipped = skipped,
                    "Delta referenced missing breakdowns or rollovers"
                );
            }
        }
        applied.insert(delta.delta_id);
        Ok(true)
    }

    async fn applied_deltas(&self, delta_ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError> {
        let applied = self.applied.lock().map_err(|e| poisoned("applied", e))?;
        Ok(delta_ids
            .iter()
            .filter(|id| applied.contains(id))
            .copied()
            .collect())
    }

    async fn insert_grant(
        &self,
        grant: &CreateGrant,
        breakdown: &Breakdown,
    ) -> Result<(), AppError> {
        let key = LedgerKey::new(grant.customer_id.clone(), grant.feature_id.clone());
        let mut ledgers = self.ledgers.lock().map_err(|e| poisoned("store", e))?;
        let ledger = ledgers.get_mut(&key).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("no ledger for {}", key))
        })?;

        match ledger.products.iter_mut().find(|p| p.id == grant.product.id) {
            Some(existing) => *existing = grant.product.clone(),
            None => ledger.products.push(grant.product.clone()),
        }
        ledger.breakdowns.push(breakdown.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Cache stand-in with the same compare-and-set and journal semantics as Redis.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<LedgerKey, FeatureLedger>>,
    journal: Mutex<HashMap<Uuid, BalanceDelta>>,
    dead_letters: Mutex<Vec<BalanceDelta>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceCache for InMemoryCache {
    async fn get(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError> {
        Ok(self
            .entries
            .lock()
            .map_err(|e| poisoned("cache", e))?
            .get(key)
            .cloned())
    }

    async fn compare_and_set(
        &self,
        expected: Option<u64>,
        ledger: &FeatureLedger,
        delta: Option<&BalanceDelta>,
    ) -> Result<bool, AppError> {
        let mut entries = self.entries.lock().map_err(|e| poisoned("cache", e))?;
        let current = entries.get(&ledger.key()).map(|l| l.version);
        if current != expected {
            return Ok(false);
        }
        entries.insert(ledger.key(), ledger.clone());
        if let Some(delta) = delta {
            self.journal
                .lock()
                .map_err(|e| poisoned("journal", e))?
                .insert(delta.delta_id, delta.clone());
        }
        Ok(true)
    }

    async fn evict(&self, key: &LedgerKey) -> Result<(), AppError> {
        self.entries
            .lock()
            .map_err(|e| poisoned("cache", e))?
            .remove(key);
        Ok(())
    }

    async fn journal(&self) -> Result<Vec<BalanceDelta>, AppError> {
        Ok(self
            .journal
            .lock()
            .map_err(|e| poisoned("journal", e))?
            .values()
            .cloned()
            .collect())
    }

    async fn journal_ack(&self, delta_id: Uuid) -> Result<(), AppError> {
        self.journal
            .lock()
            .map_err(|e| poisoned("journal", e))?
            .remove(&delta_id);
        Ok(())
    }

    async fn push_dead_letter(&self, delta: &BalanceDelta) -> Result<(), AppError> {
        self.dead_letters
            .lock()
            .map_err(|e| poisoned("dead letters", e))?
            .push(delta.clone());
        Ok(())
    }

    async fn take_dead_letters(&self) -> Result<Vec<BalanceDelta>, AppError> {
        Ok(std::mem::take(
            &mut *self
                .dead_letters
                .lock()
                .map_err(|e| poisoned("dead letters", e))?,
        ))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
