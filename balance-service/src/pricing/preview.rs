//! Preview of plan and quantity changes.
//!
//! A change is priced as a refund of the prorated old amount plus a charge of
//! the prorated new amount. Discounts reduce charge lines only.

use crate::error::LedgerError;
use crate::models::{Discount, PriceConfig};
use crate::pricing::proration::{proration_factor, BillingPeriod};
use crate::pricing::round_money;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineDirection {
    Charge,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub direction: LineDirection,
    /// Signed amount after proration and discounts; refunds are negative.
    pub amount: Decimal,
    pub proration_factor: Decimal,
    pub discount_amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    pub total: Decimal,
    pub line_items: Vec<LineItem>,
}

/// A price applied to a quantity, as held by a plan being removed or added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedItem {
    pub description: String,
    pub price: PriceConfig,
    pub quantity: Decimal,
}

impl PricedItem {
    pub fn new(description: impl Into<String>, price: PriceConfig, quantity: Decimal) -> Self {
        Self {
            description: description.into(),
            price,
            quantity,
        }
    }
}

struct Draft {
    description: String,
    direction: LineDirection,
    amount: Decimal,
    discount: Decimal,
}

fn percent_multiplier(discounts: &[Discount]) -> Result<Decimal, LedgerError> {
    discounts.iter().try_fold(Decimal::ONE, |acc, d| match d {
        Discount::Percent(p) if *p < Decimal::ZERO || *p > Decimal::ONE => Err(
            LedgerError::validation(format!("percent discount {} is outside [0, 1]", p)),
        ),
        Discount::Percent(p) => Ok(acc * (Decimal::ONE - *p)),
        Discount::Fixed(_) => Ok(acc),
    })
}

fn fixed_discount_total(discounts: &[Discount]) -> Result<Decimal, LedgerError> {
    discounts.iter().try_fold(Decimal::ZERO, |acc, d| match d {
        Discount::Fixed(v) if *v < Decimal::ZERO => Err(LedgerError::validation(format!(
            "fixed discount {} is negative",
            v
        ))),
        Discount::Fixed(v) => Ok(acc + *v),
        Discount::Percent(_) => Ok(acc),
    })
}

/// Price swapping `removed` for `added` at `now` within `period`.
///
/// Nothing is mutated; any error is returned before a preview is built.
pub fn preview_plan_change(
    removed: &[PricedItem],
    added: &[PricedItem],
    period: &BillingPeriod,
    now: DateTime<Utc>,
    discounts: &[Discount],
) -> Result<Preview, LedgerError> {
    let factor = proration_factor(period, now)?;
    let multiplier = percent_multiplier(discounts)?;
    let mut fixed_left = fixed_discount_total(discounts)?;

    let mut drafts = Vec::with_capacity(removed.len() + added.len());

    for item in removed {
        let full = item.price.amount_for(item.quantity)?;
        drafts.push(Draft {
            description: format!("Unused time on {}", item.description),
            direction: LineDirection::Refund,
            amount: -(full * factor),
            discount: Decimal::ZERO,
        });
    }

    for item in added {
        let prorated = item.price.amount_for(item.quantity)? * factor;
        let after_percent = prorated * multiplier;
        let fixed = fixed_left.min(after_percent.max(Decimal::ZERO));
        fixed_left -= fixed;
        drafts.push(Draft {
            description: format!("Remaining time on {}", item.description),
            direction: LineDirection::Charge,
            amount: after_percent - fixed,
            discount: prorated - after_percent + fixed,
        });
    }

    let total = drafts.iter().map(|d| d.amount).sum::<Decimal>();
    let line_items = drafts
        .into_iter()
        .filter(|d| !(d.amount.is_zero() && d.discount.is_zero()))
        .map(|d| LineItem {
            description: d.description,
            direction: d.direction,
            amount: round_money(d.amount),
            proration_factor: factor,
            discount_amount: round_money(d.discount),
        })
        .collect();

    Ok(Preview {
        total: round_money(total),
        line_items,
    })
}

/// Price a quantity change on a single price; delegates to
/// [`preview_plan_change`] with the old quantity removed and the new one added.
pub fn preview_quantity_change(
    description: &str,
    price: &PriceConfig,
    old_quantity: Decimal,
    new_quantity: Decimal,
    period: &BillingPeriod,
    now: DateTime<Utc>,
    discounts: &[Discount],
) -> Result<Preview, LedgerError> {
    if old_quantity < Decimal::ZERO || new_quantity < Decimal::ZERO {
        return Err(LedgerError::validation("quantity must not be negative"));
    }
    preview_plan_change(
        &[PricedItem::new(description, price.clone(), old_quantity)],
        &[PricedItem::new(description, price.clone(), new_quantity)],
        period,
        now,
        discounts,
    )
}
