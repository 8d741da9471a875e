//! Cache-first ledger repository and the background store writer.
//!
//! Mutations land in the cache under a per-key lock and a versioned
//! compare-and-set, are journaled as relative deltas, and are persisted to
//! the durable store by a pool of writers. Each key always hashes to the
//! same writer, so the store sees a key's deltas in submission order.

use crate::config::SyncConfig;
use crate::error::LedgerError;
use crate::models::{BalanceDelta, Breakdown, CreateGrant, FeatureLedger, LedgerKey};
use crate::services::metrics::{
    CAS_CONFLICTS_TOTAL, SYNC_DEAD_LETTERS_TOTAL, SYNC_QUEUE_DEPTH, SYNC_RETRIES_TOTAL,
};
use crate::services::store::{BalanceCache, LedgerStore};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Pool of store writers fed through bounded per-shard queues.
pub struct SyncWriter {
    config: SyncConfig,
    senders: Vec<mpsc::Sender<BalanceDelta>>,
    pending: Arc<DashMap<LedgerKey, usize>>,
    settled: Arc<Notify>,
    cache: Arc<dyn BalanceCache>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncWriter {
    /// Spawn `config.worker_count` writers.
    pub fn start(
        config: SyncConfig,
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
    ) -> Arc<Self> {
        let pending = Arc::new(DashMap::new());
        let settled = Arc::new(Notify::new());
        let shutdown_token = CancellationToken::new();
        let worker_count = config.worker_count.max(1);
        let queue_size = config.queue_size.max(1);

        info!(worker_count = worker_count, "Starting store writers");

        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_size);
            senders.push(tx);
            let worker = Writer {
                id,
                config: config.clone(),
                store: store.clone(),
                cache: cache.clone(),
                pending: pending.clone(),
                settled: settled.clone(),
            };
            handles.push(tokio::spawn(worker.run(rx, shutdown_token.clone())));
        }

        Arc::new(Self {
            config,
            senders,
            pending,
            settled,
            cache,
            shutdown_token,
            handles: Mutex::new(handles),
        })
    }

    fn shard(&self, key: &LedgerKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue `delta` for persistence. Waits when the shard's queue is full.
    pub async fn submit(&self, delta: BalanceDelta) -> Result<(), AppError> {
        let key = delta.key.clone();
        *self.pending.entry(key.clone()).or_insert(0) += 1;
        SYNC_QUEUE_DEPTH.inc();

        let shard = self.shard(&key);
        if let Err(e) = self.senders[shard].send(delta).await {
            settle(&self.pending, &self.settled, &key);
            // Still journaled; the next replay picks it up.
            warn!(key = %key, delta_id = %e.0.delta_id, "Store writer stopped, delta left in journal");
            return Err(AppError::ServiceUnavailable);
        }
        Ok(())
    }

    /// Whether `key` has deltas queued or in flight.
    pub fn is_pending(&self, key: &LedgerKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Wait until every delta submitted for `key` has settled, either
    /// persisted or dead-lettered.
    pub async fn wait_idle(&self, key: &LedgerKey) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.pending.contains_key(key) {
                return;
            }
            notified.await;
        }
    }

    /// Wait until nothing is queued or in flight.
    pub async fn flush(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// [`flush`](Self::flush) bounded by the settle window. Returns `false`
    /// if deltas were still outstanding when the window closed.
    pub async fn settle(&self) -> bool {
        tokio::time::timeout(self.config.settle_window(), self.flush())
            .await
            .is_ok()
    }

    /// Resubmit every journaled delta, oldest first. Used at start-up to
    /// finish writes interrupted by a restart.
    #[instrument(skip(self))]
    pub async fn replay_journal(&self) -> Result<usize, AppError> {
        let mut journal = self.cache.journal().await?;
        // seq restarts when an evicted ledger is reloaded, so order by time first
        journal.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));

        let count = journal.len();
        for delta in journal {
            self.submit(delta).await?;
        }
        if count > 0 {
            info!(count = count, "Replayed journaled deltas");
        }
        Ok(count)
    }

    /// Resubmit dead-lettered deltas.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<usize, AppError> {
        let mut dead = self.cache.take_dead_letters().await?;
        dead.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));

        let count = dead.len();
        for delta in dead {
            self.submit(delta).await?;
        }
        info!(count = count, "Resubmitted dead-lettered deltas");
        Ok(count)
    }

    /// Stop the writers. Deltas still queued stay in the journal.
    pub async fn shutdown(&self) {
        info!("Initiating store writer shutdown");
        self.shutdown_token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Store writer task failed");
            }
        }
    }
}

fn settle(pending: &DashMap<LedgerKey, usize>, settled: &Notify, key: &LedgerKey) {
    if let Entry::Occupied(mut entry) = pending.entry(key.clone()) {
        *entry.get_mut() -= 1;
        if *entry.get() == 0 {
            entry.remove();
        }
    }
    SYNC_QUEUE_DEPTH.dec();
    settled.notify_waiters();
}

struct Writer {
    id: usize,
    config: SyncConfig,
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    pending: Arc<DashMap<LedgerKey, usize>>,
    settled: Arc<Notify>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<BalanceDelta>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    // Queued deltas stay journaled; only their pending counts go.
                    rx.close();
                    let mut left = 0;
                    while let Ok(delta) = rx.try_recv() {
                        settle(&self.pending, &self.settled, &delta.key);
                        left += 1;
                    }
                    if left > 0 {
                        info!(writer_id = self.id, left = left, "Store writer stopped with deltas left in journal");
                    }
                    debug!(writer_id = self.id, "Store writer shutting down");
                    break;
                }
                delta = rx.recv() => {
                    match delta {
                        Some(delta) => {
                            let key = delta.key.clone();
                            self.persist(delta).await;
                            settle(&self.pending, &self.settled, &key);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    #[instrument(skip(self, delta), fields(writer_id = self.id, delta_id = %delta.delta_id, key = %delta.key, seq = delta.seq))]
    async fn persist(&self, delta: BalanceDelta) {
        let backoff = ExponentialBackoff {
            initial_interval: self.config.initial_interval(),
            current_interval: self.config.initial_interval(),
            max_elapsed_time: Some(self.config.max_elapsed()),
            ..Default::default()
        };

        let result = retry(backoff, || async {
            self.store.apply_delta(&delta).await.map_err(|e| {
                if e.is_transient() {
                    SYNC_RETRIES_TOTAL.inc();
                    warn!(error = %e, "Store write failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await;

        match result {
            Ok(applied) => {
                if !applied {
                    debug!("Delta was already durable");
                }
                if let Err(e) = self.cache.journal_ack(delta.delta_id).await {
                    // Harmless: a replay is skipped by the store.
                    warn!(error = %e, "Failed to remove delta from journal");
                }
            }
            Err(e) => {
                SYNC_DEAD_LETTERS_TOTAL.inc();
                error!(error = %e, ops = delta.ops.len(), "Store write failed after retries, dead-lettering delta");
                if let Err(e) = self.cache.push_dead_letter(&delta).await {
                    error!(error = %e, "Failed to dead-letter delta; it remains in the journal");
                }
            }
        }
    }
}

/// Balance fields compared by [`LedgerRepository::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakdownSnapshot {
    pub granted_balance: Decimal,
    pub current_balance: Decimal,
    pub purchased_balance: Decimal,
    pub usage: Decimal,
    pub rollover_balance: Decimal,
}

impl From<&Breakdown> for BreakdownSnapshot {
    fn from(b: &Breakdown) -> Self {
        Self {
            granted_balance: b.granted_balance,
            current_balance: b.current_balance,
            purchased_balance: b.purchased_balance,
            usage: b.usage,
            rollover_balance: b.rollovers.iter().map(|r| r.balance).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownDifference {
    pub breakdown_id: Uuid,
    pub cached: Option<BreakdownSnapshot>,
    pub stored: Option<BreakdownSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub key: LedgerKey,
    /// False when nothing was cached, in which case there is nothing to compare.
    pub cached: bool,
    pub differences: Vec<BreakdownDifference>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.differences.is_empty()
    }
}

/// A held per-key mutation lock. Dropping it releases the lock and removes
/// the map entry when no other task is waiting on it.
struct KeyLock<'a> {
    locks: &'a DashMap<LedgerKey, Arc<Mutex<()>>>,
    key: LedgerKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Fast and durable repositories behind one read-write interface.
pub struct LedgerRepository {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    writer: Arc<SyncWriter>,
    locks: DashMap<LedgerKey, Arc<Mutex<()>>>,
    cas_max_retries: u32,
}

impl LedgerRepository {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        writer: Arc<SyncWriter>,
        cas_max_retries: u32,
    ) -> Self {
        Self {
            store,
            cache,
            writer,
            locks: DashMap::new(),
            cas_max_retries: cas_max_retries.max(1),
        }
    }

    pub fn writer(&self) -> &Arc<SyncWriter> {
        &self.writer
    }

    async fn lock_key(&self, key: &LedgerKey) -> KeyLock<'_> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyLock {
            locks: &self.locks,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    async fn load_from_store(&self, key: &LedgerKey) -> Result<FeatureLedger, LedgerError> {
        // A ledger with writes in flight would load stale from the store.
        self.writer.wait_idle(key).await;
        self.store.load_ledger(key).await?.ok_or_else(|| {
            LedgerError::not_found(format!(
                "customer '{}' or feature '{}'",
                key.customer_id, key.feature_id
            ))
        })
    }

    /// The stored ledger with every journaled delta the store has not
    /// applied yet, such as dead-lettered writes, replayed on top.
    async fn rebuild(&self, key: &LedgerKey) -> Result<FeatureLedger, LedgerError> {
        let mut ledger = self.load_from_store(key).await?;

        let mut journaled: Vec<BalanceDelta> = self
            .cache
            .journal()
            .await?
            .into_iter()
            .filter(|d| &d.key == key)
            .collect();
        if journaled.is_empty() {
            return Ok(ledger);
        }

        let ids: Vec<Uuid> = journaled.iter().map(|d| d.delta_id).collect();
        let applied = self.store.applied_deltas(&ids).await?;
        journaled.retain(|d| !applied.contains(&d.delta_id));
        journaled.sort_by(|a, b| (a.created_at, a.seq).cmp(&(b.created_at, b.seq)));

        for delta in &journaled {
            ledger.apply_ops(&delta.ops);
        }
        if !journaled.is_empty() {
            warn!(count = journaled.len(), "Rebuilt ledger from store plus unpersisted deltas");
        }
        Ok(ledger)
    }

    /// The cached ledger and its version, or a rebuilt one with no version.
    async fn current(&self, key: &LedgerKey) -> Result<(Option<u64>, FeatureLedger), LedgerError> {
        match self.cache.get(key).await? {
            Some(ledger) => Ok((Some(ledger.version), ledger)),
            None => Ok((None, self.rebuild(key).await?)),
        }
    }

    /// Read a ledger. The cache is filled on a miss; `bypass_cache` reads
    /// the durable store directly.
    #[instrument(skip(self), fields(customer_id = %key.customer_id, feature_id = %key.feature_id))]
    pub async fn read(&self, key: &LedgerKey, bypass_cache: bool) -> Result<FeatureLedger, LedgerError> {
        if bypass_cache {
            return self.load_from_store(key).await;
        }
        let (version, ledger) = self.current(key).await?;
        if version.is_none() && !self.cache.compare_and_set(None, &ledger, None).await? {
            debug!("Cache filled concurrently");
        }
        Ok(ledger)
    }

    /// Run `mutate` against the latest ledger for `key` and commit the result
    /// to the cache, journal and store writer.
    ///
    /// Mutations of one key are serialised in-process; across processes the
    /// cache compare-and-set decides, and a lost race re-runs `mutate` on the
    /// fresh ledger up to the configured number of attempts.
    #[instrument(skip(self, mutate), fields(customer_id = %key.customer_id, feature_id = %key.feature_id))]
    pub async fn mutate<T, F>(&self, key: &LedgerKey, mut mutate: F) -> Result<T, LedgerError>
    where
        F: FnMut(&mut FeatureLedger) -> Result<T, LedgerError>,
    {
        let _lock = self.lock_key(key).await;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let (expected, current) = self.current(key).await?;
            let mut next = current.clone();
            let out = mutate(&mut next)?;

            if next == current && expected.is_some() {
                return Ok(out);
            }

            next.version = current.version + 1;
            let delta = BalanceDelta::diff(&current, &next, next.version);
            let journaled = (!delta.is_empty()).then_some(&delta);

            if self.cache.compare_and_set(expected, &next, journaled).await? {
                if !delta.is_empty() {
                    debug!(ops = delta.ops.len(), seq = delta.seq, "Ledger mutated");
                    // A stopped writer leaves the delta journaled for replay.
                    if self.writer.submit(delta).await.is_err() {
                        debug!("Delta not queued");
                    }
                }
                return Ok(out);
            }

            CAS_CONFLICTS_TOTAL.inc();
            warn!(attempt = attempts, "Lost cache compare-and-set race");
            if attempts >= self.cas_max_retries {
                return Err(LedgerError::ConcurrencyConflict { attempts });
            }
        }
    }

    /// Persist a new grant and drop the cached ledger so the next access
    /// rebuilds it with the new breakdown.
    #[instrument(skip(self, grant), fields(customer_id = %grant.customer_id, feature_id = %grant.feature_id))]
    pub async fn insert_grant(&self, grant: &CreateGrant) -> Result<Breakdown, LedgerError> {
        let key = LedgerKey::new(grant.customer_id.clone(), grant.feature_id.clone());
        let _lock = self.lock_key(&key).await;

        self.writer.wait_idle(&key).await;
        let breakdown = grant.to_breakdown(Utc::now());
        self.store.insert_grant(grant, &breakdown).await?;
        self.cache.evict(&key).await?;
        Ok(breakdown)
    }

    pub async fn evict(&self, key: &LedgerKey) -> Result<(), LedgerError> {
        self.cache.evict(key).await?;
        Ok(())
    }

    /// Compare cached and stored breakdowns of `key`.
    #[instrument(skip(self), fields(customer_id = %key.customer_id, feature_id = %key.feature_id))]
    pub async fn verify(&self, key: &LedgerKey) -> Result<ConsistencyReport, LedgerError> {
        let stored = self.load_from_store(key).await?;
        let Some(cached) = self.cache.get(key).await? else {
            return Ok(ConsistencyReport {
                key: key.clone(),
                cached: false,
                differences: Vec::new(),
            });
        };

        let mut differences = Vec::new();
        for b in &cached.breakdowns {
            let c = BreakdownSnapshot::from(b);
            let s = stored.breakdown(b.id).map(BreakdownSnapshot::from);
            if s != Some(c) {
                differences.push(BreakdownDifference {
                    breakdown_id: b.id,
                    cached: Some(c),
                    stored: s,
                });
            }
        }
        for b in &stored.breakdowns {
            if cached.breakdown(b.id).is_none() {
                differences.push(BreakdownDifference {
                    breakdown_id: b.id,
                    cached: None,
                    stored: Some(BreakdownSnapshot::from(b)),
                });
            }
        }

        if !differences.is_empty() {
            warn!(count = differences.len(), "Cache and store disagree");
        }
        Ok(ConsistencyReport {
            key: key.clone(),
            cached: true,
            differences,
        })
    }
}
