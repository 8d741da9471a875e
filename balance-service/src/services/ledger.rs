//! Ledger operations: track, balance updates, checks, grants, resets and
//! plan switches, plus the pricing previews.

use crate::error::LedgerError;
use crate::ledger::{apply_update, apply_usage, carryover, resolve, sort_canonical};
use crate::models::{
    AggregateBalance, BalanceUpdate, Breakdown, BreakdownView, CheckRequest, CheckResponse,
    CreateGrant, Discount, LedgerKey, PriceConfig, TrackRequest,
};
use crate::pricing::{self, BillingPeriod, Preview, PricedItem};
use crate::services::metrics::{record_error, record_operation};
use crate::services::sync::{ConsistencyReport, LedgerRepository};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

fn observe<T>(operation: &str, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
    record_operation(operation, result.is_ok());
    if let Err(e) = &result {
        record_error(e.kind());
    }
    result
}

#[derive(Clone)]
pub struct LedgerService {
    repo: Arc<LedgerRepository>,
}

impl LedgerService {
    pub fn new(repo: Arc<LedgerRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<LedgerRepository> {
        &self.repo
    }

    /// Record usage (or a refund, for a negative value) and return the
    /// resulting aggregate balance for the requested scope.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, feature_id = %request.feature_id, entity_id = ?request.entity_id))]
    pub async fn track(&self, request: TrackRequest) -> Result<AggregateBalance, LedgerError> {
        let value = request.value.unwrap_or(Decimal::ONE);
        let key = LedgerKey::new(request.customer_id.clone(), request.feature_id.clone());
        let now = Utc::now();

        let result = self
            .repo
            .mutate(&key, |ledger| {
                let mut resolved = resolve(ledger, request.entity_id.as_deref(), now)?;
                if resolved.is_empty() {
                    return Ok(AggregateBalance::default());
                }

                let outcome = apply_usage(&mut resolved, value, now);
                if !outcome.unapplied.is_zero() {
                    warn!(
                        value = %value,
                        unapplied = %outcome.unapplied,
                        "Usage exceeded what the breakdowns could absorb"
                    );
                }

                let balance = AggregateBalance::from_breakdowns(&resolved, now);
                ledger.write_back(resolved);
                Ok(balance)
            })
            .await;

        if result.is_ok() {
            info!(value = %value, "Usage tracked");
        }
        observe("track", result)
    }

    /// Set balances explicitly on one breakdown or across a scope.
    #[instrument(skip(self, update), fields(customer_id = %update.customer_id, feature_id = %update.feature_id, breakdown_id = ?update.breakdown_id))]
    pub async fn update_balance(&self, update: BalanceUpdate) -> Result<AggregateBalance, LedgerError> {
        let key = LedgerKey::new(update.customer_id.clone(), update.feature_id.clone());
        let now = Utc::now();

        let result = self
            .repo
            .mutate(&key, |ledger| {
                let mut resolved = resolve(ledger, update.entity_id.as_deref(), now)?;
                apply_update(ledger, &mut resolved, &update)?;
                let balance = AggregateBalance::from_breakdowns(&resolved, now);
                ledger.write_back(resolved);
                Ok(balance)
            })
            .await;

        if result.is_ok() {
            info!("Balance updated");
        }
        observe("update", result)
    }

    /// Aggregate balance and ordered breakdowns for the requested scope.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, feature_id = %request.feature_id, bypass_cache = request.bypass_cache))]
    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse, LedgerError> {
        let key = LedgerKey::new(request.customer_id.clone(), request.feature_id.clone());
        let now = Utc::now();

        let result = async {
            let ledger = self.repo.read(&key, request.bypass_cache).await?;
            let resolved = resolve(&ledger, request.entity_id.as_deref(), now)?;
            Ok(CheckResponse {
                balance: AggregateBalance::from_breakdowns(&resolved, now),
                breakdowns: resolved
                    .iter()
                    .map(|b| BreakdownView::from_breakdown(b, now))
                    .collect(),
            })
        }
        .await;

        observe("check", result)
    }

    /// Add a breakdown for an attached product or prepaid purchase.
    #[instrument(skip(self, grant), fields(customer_id = %grant.customer_id, feature_id = %grant.feature_id, plan_id = %grant.product.plan_id))]
    pub async fn create_grant(&self, grant: CreateGrant) -> Result<Breakdown, LedgerError> {
        let result = async {
            if grant.granted_balance < Decimal::ZERO && !grant.overage_allowed {
                return Err(LedgerError::validation(
                    "granted_balance must not be negative without overage",
                ));
            }
            if let Some(cfg) = &grant.rollover_config {
                if cfg.max.is_some_and(|max| max < Decimal::ZERO) {
                    return Err(LedgerError::config("rollover max must not be negative"));
                }
            }
            if grant.next_reset_at.is_none() && grant.reset_interval.resets() {
                return Err(LedgerError::validation(format!(
                    "{} grant needs next_reset_at",
                    grant.reset_interval
                )));
            }
            self.repo.insert_grant(&grant).await
        }
        .await;

        if let Ok(b) = &result {
            info!(breakdown_id = %b.id, granted_balance = %b.granted_balance, "Grant created");
        }
        observe("create_grant", result)
    }

    /// Reset every breakdown of the ledger whose cycle boundary has passed.
    /// Returns the number of breakdowns reset.
    #[instrument(skip(self))]
    pub async fn reset_due(
        &self,
        customer_id: &str,
        feature_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let key = LedgerKey::new(customer_id, feature_id);
        let result = self
            .repo
            .mutate(&key, |ledger| Ok(carryover::reset_due(&mut ledger.breakdowns, now)))
            .await;

        if let Ok(count) = &result {
            if *count > 0 {
                info!(count = *count, "Breakdowns reset");
            }
        }
        observe("reset", result)
    }

    /// Carry rollover credit from the breakdowns of `from_product` to the
    /// first breakdown of `to_product`. Returns the amount carried.
    #[instrument(skip(self))]
    pub async fn switch_plan(
        &self,
        customer_id: &str,
        feature_id: &str,
        from_product: Uuid,
        to_product: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let key = LedgerKey::new(customer_id, feature_id);
        let result = self
            .repo
            .mutate(&key, |ledger| {
                let mut sources: Vec<Breakdown> = ledger
                    .breakdowns
                    .iter()
                    .filter(|b| b.customer_product_id == from_product)
                    .cloned()
                    .collect();
                let mut destinations: Vec<Breakdown> = ledger
                    .breakdowns
                    .iter()
                    .filter(|b| b.customer_product_id == to_product)
                    .cloned()
                    .collect();
                sort_canonical(&mut destinations);
                let Some(mut destination) = destinations.into_iter().next() else {
                    return Err(LedgerError::not_found(format!(
                        "no '{}' breakdown on product {}",
                        ledger.feature.feature_id, to_product
                    )));
                };

                let carried = carryover::transfer_rollovers(&mut sources, &mut destination, now);
                sources.push(destination);
                ledger.write_back(sources);
                Ok(carried)
            })
            .await;

        if let Ok(carried) = &result {
            info!(carried = %carried, "Rollover carried across plan switch");
        }
        observe("switch_plan", result)
    }

    /// Compare cached and stored balances for one ledger.
    pub async fn verify(&self, customer_id: &str, feature_id: &str) -> Result<ConsistencyReport, LedgerError> {
        self.repo.verify(&LedgerKey::new(customer_id, feature_id)).await
    }

    pub fn preview_plan_change(
        &self,
        removed: &[PricedItem],
        added: &[PricedItem],
        period: &BillingPeriod,
        now: DateTime<Utc>,
        discounts: &[Discount],
    ) -> Result<Preview, LedgerError> {
        observe(
            "preview",
            pricing::preview_plan_change(removed, added, period, now, discounts),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn preview_quantity_change(
        &self,
        description: &str,
        price: &PriceConfig,
        old_quantity: Decimal,
        new_quantity: Decimal,
        period: &BillingPeriod,
        now: DateTime<Utc>,
        discounts: &[Discount],
    ) -> Result<Preview, LedgerError> {
        observe(
            "preview",
            pricing::preview_quantity_change(
                description,
                price,
                old_quantity,
                new_quantity,
                period,
                now,
                discounts,
            ),
        )
    }
}
