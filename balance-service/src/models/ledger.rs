//! Cache/store document for one (customer, feature) and the deltas that mutate it.

use crate::models::{Breakdown, CustomerProduct, Entity, Feature, Rollover};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lock and cache unit: all breakdowns of one feature for one customer,
/// including every entity's breakdowns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub customer_id: String,
    pub feature_id: String,
}

impl LedgerKey {
    pub fn new(customer_id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            feature_id: feature_id.into(),
        }
    }
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.customer_id, self.feature_id)
    }
}

/// Address of a balance as requested by callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceKey {
    pub customer_id: String,
    pub feature_id: String,
    pub entity_id: Option<String>,
}

impl BalanceKey {
    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey::new(self.customer_id.clone(), self.feature_id.clone())
    }
}

/// Everything needed to resolve and mutate a feature balance for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLedger {
    pub customer_id: String,
    pub feature: Feature,
    pub entities: Vec<Entity>,
    pub products: Vec<CustomerProduct>,
    pub breakdowns: Vec<Breakdown>,
    /// Incremented on every cached mutation; used for compare-and-set.
    pub version: u64,
}

impl FeatureLedger {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.customer_id.clone(), self.feature.feature_id.clone())
    }

    pub fn product(&self, id: Uuid) -> Option<&CustomerProduct> {
        self.products.iter().find(|p| p.id == id)
    }

    pub fn entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.entity_id == entity_id)
    }

    pub fn breakdown(&self, id: Uuid) -> Option<&Breakdown> {
        self.breakdowns.iter().find(|b| b.id == id)
    }

    /// Apply `ops` in place. Returns how many ops referenced a breakdown or
    /// rollover that no longer exists and were skipped.
    pub fn apply_ops(&mut self, ops: &[DeltaOp]) -> usize {
        let mut skipped = 0;
        for op in ops {
            let applied = match op {
                DeltaOp::AdjustBreakdown {
                    breakdown_id,
                    granted,
                    current,
                    purchased,
                    usage,
                } => self.breakdown_mut(*breakdown_id).map(|b| {
                    b.granted_balance += *granted;
                    b.current_balance += *current;
                    b.purchased_balance += *purchased;
                    b.usage += *usage;
                }),
                DeltaOp::SetNextReset {
                    breakdown_id,
                    next_reset_at,
                } => self
                    .breakdown_mut(*breakdown_id)
                    .map(|b| b.next_reset_at = *next_reset_at),
                DeltaOp::AdjustRollover {
                    rollover_id,
                    balance,
                    usage,
                } => self
                    .breakdowns
                    .iter_mut()
                    .flat_map(|b| b.rollovers.iter_mut())
                    .find(|r| r.id == *rollover_id)
                    .map(|r| {
                        r.balance += *balance;
                        r.usage += *usage;
                    }),
                DeltaOp::InsertRollover { rollover } => {
                    self.breakdown_mut(rollover.breakdown_id).map(|b| {
                        if !b.rollovers.iter().any(|r| r.id == rollover.id) {
                            b.rollovers.push(rollover.clone());
                        }
                    })
                }
                DeltaOp::DeleteRollover { rollover_id } => {
                    for b in self.breakdowns.iter_mut() {
                        b.rollovers.retain(|r| r.id != *rollover_id);
                    }
                    Some(())
                }
            };
            if applied.is_none() {
                skipped += 1;
            }
        }
        skipped
    }

    fn breakdown_mut(&mut self, id: Uuid) -> Option<&mut Breakdown> {
        self.breakdowns.iter_mut().find(|b| b.id == id)
    }

    /// Write mutated copies back by id. Unknown ids are ignored.
    pub fn write_back(&mut self, updated: Vec<Breakdown>) {
        for b in updated {
            if let Some(slot) = self.breakdowns.iter_mut().find(|x| x.id == b.id) {
                *slot = b;
            }
        }
    }
}

/// One replayable change to the durable store.
///
/// Balance changes are relative so that the store converges on the cache
/// regardless of the absolute values it currently holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    AdjustBreakdown {
        breakdown_id: Uuid,
        granted: Decimal,
        current: Decimal,
        purchased: Decimal,
        usage: Decimal,
    },
    SetNextReset {
        breakdown_id: Uuid,
        next_reset_at: Option<DateTime<Utc>>,
    },
    AdjustRollover {
        rollover_id: Uuid,
        balance: Decimal,
        usage: Decimal,
    },
    InsertRollover {
        rollover: Rollover,
    },
    DeleteRollover {
        rollover_id: Uuid,
    },
}

/// Idempotent unit of durable persistence. The store records `delta_id`
/// and ignores a delta it has already applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub delta_id: Uuid,
    pub key: LedgerKey,
    /// Ledger version produced by this delta; orders deltas of one key.
    pub seq: u64,
    pub ops: Vec<DeltaOp>,
    pub created_at: DateTime<Utc>,
}

impl BalanceDelta {
    /// Describe the change from `before` to `after` as relative operations.
    pub fn diff(before: &FeatureLedger, after: &FeatureLedger, seq: u64) -> Self {
        let mut ops = Vec::new();
        let old: HashMap<Uuid, &Breakdown> = before.breakdowns.iter().map(|b| (b.id, b)).collect();

        for new in &after.breakdowns {
            let Some(prev) = old.get(&new.id) else {
                continue;
            };

            let granted = new.granted_balance - prev.granted_balance;
            let current = new.current_balance - prev.current_balance;
            let purchased = new.purchased_balance - prev.purchased_balance;
            let usage = new.usage - prev.usage;
            if [granted, current, purchased, usage].iter().any(|d| !d.is_zero()) {
                ops.push(DeltaOp::AdjustBreakdown {
                    breakdown_id: new.id,
                    granted,
                    current,
                    purchased,
                    usage,
                });
            }

            if new.next_reset_at != prev.next_reset_at {
                ops.push(DeltaOp::SetNextReset {
                    breakdown_id: new.id,
                    next_reset_at: new.next_reset_at,
                });
            }

            let old_rollovers: HashMap<Uuid, &Rollover> =
                prev.rollovers.iter().map(|r| (r.id, r)).collect();
            for r in &new.rollovers {
                match old_rollovers.get(&r.id) {
                    Some(o) => {
                        let balance = r.balance - o.balance;
                        let usage = r.usage - o.usage;
                        if !(balance.is_zero() && usage.is_zero()) {
                            ops.push(DeltaOp::AdjustRollover {
                                rollover_id: r.id,
                                balance,
                                usage,
                            });
                        }
                    }
                    None => ops.push(DeltaOp::InsertRollover { rollover: r.clone() }),
                }
            }
            for o in &prev.rollovers {
                if !new.rollovers.iter().any(|r| r.id == o.id) {
                    ops.push(DeltaOp::DeleteRollover { rollover_id: o.id });
                }
            }
        }

        Self {
            delta_id: Uuid::new_v4(),
            key: after.key(),
            seq,
            ops,
            created_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
