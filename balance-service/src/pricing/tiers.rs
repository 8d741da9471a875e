//! Graduated and volume tier-rate calculations.
//!
//! Amounts are returned at full decimal precision; callers round money to
//! two places when presenting it.

use crate::error::LedgerError;
use crate::models::{TierBound, UsageTier};
use rust_decimal::Decimal;

/// Validate tiers and put them in matching order: finite bounds ascending,
/// the infinite tier last wherever it was declared.
pub fn normalize_tiers(tiers: &[UsageTier]) -> Result<Vec<UsageTier>, LedgerError> {
    if tiers.is_empty() {
        return Err(LedgerError::config("usage price has no tiers"));
    }

    let mut finite = Vec::with_capacity(tiers.len());
    let mut infinite = None;
    let mut last_bound: Option<Decimal> = None;

    for tier in tiers {
        if tier.amount < Decimal::ZERO {
            return Err(LedgerError::validation("tier amount must not be negative"));
        }
        match tier.to {
            TierBound::Infinite => {
                if infinite.is_some() {
                    return Err(LedgerError::validation(
                        "only one tier may have an infinite upper bound",
                    ));
                }
                infinite = Some(tier.clone());
            }
            TierBound::UpTo(to) => {
                if to <= Decimal::ZERO {
                    return Err(LedgerError::validation("tier bound must be positive"));
                }
                if last_bound.is_some_and(|prev| to <= prev) {
                    return Err(LedgerError::validation(format!(
                        "tier bounds must be strictly increasing (got {} after {})",
                        to,
                        last_bound.unwrap_or_default()
                    )));
                }
                last_bound = Some(to);
                finite.push(tier.clone());
            }
        }
    }

    finite.extend(infinite);
    Ok(finite)
}

/// Prepend a free tier of `allowance` units and shift every bound up by it.
fn shift_by_allowance(tiers: Vec<UsageTier>, allowance: Decimal) -> Vec<UsageTier> {
    if allowance <= Decimal::ZERO {
        return tiers;
    }

    let mut shifted = Vec::with_capacity(tiers.len() + 1);
    shifted.push(UsageTier::up_to(allowance, Decimal::ZERO));
    shifted.extend(tiers.into_iter().map(|t| UsageTier {
        to: match t.to {
            TierBound::UpTo(to) => TierBound::UpTo(to + allowance),
            TierBound::Infinite => TierBound::Infinite,
        },
        amount: t.amount,
    }));
    shifted
}

/// Round up to the nearest multiple of `billing_units`.
pub fn round_to_billing_units(quantity: Decimal, billing_units: Decimal) -> Decimal {
    if quantity <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (quantity / billing_units).ceil() * billing_units
}

fn prepare(
    tiers: &[UsageTier],
    billing_units: Decimal,
    allowance: Decimal,
) -> Result<Vec<UsageTier>, LedgerError> {
    if billing_units <= Decimal::ZERO {
        return Err(LedgerError::validation("billing_units must be positive"));
    }
    if allowance < Decimal::ZERO {
        return Err(LedgerError::validation("allowance must not be negative"));
    }
    Ok(shift_by_allowance(normalize_tiers(tiers)?, allowance))
}

/// Apply the sign convention shared by both tier modes: negative quantities
/// are priced on their magnitude and negated when `allow_negative` is set,
/// and priced at zero otherwise.
fn signed<F>(quantity: Decimal, allow_negative: bool, price: F) -> Decimal
where
    F: FnOnce(Decimal) -> Decimal,
{
    if quantity.is_zero() {
        Decimal::ZERO
    } else if quantity < Decimal::ZERO {
        if allow_negative {
            -price(quantity.abs())
        } else {
            Decimal::ZERO
        }
    } else {
        price(quantity)
    }
}

/// Graduated pricing: each unit is charged at the rate of the tier it falls in.
pub fn graduated_tier_amount(
    tiers: &[UsageTier],
    quantity: Decimal,
    billing_units: Decimal,
    allowance: Decimal,
    allow_negative: bool,
) -> Result<Decimal, LedgerError> {
    let tiers = prepare(tiers, billing_units, allowance)?;
    let last = tiers.len() - 1;

    Ok(signed(quantity, allow_negative, |q| {
        let mut remaining = round_to_billing_units(q, billing_units);
        let mut floor = Decimal::ZERO;
        let mut total = Decimal::ZERO;

        for (i, tier) in tiers.iter().enumerate() {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = match tier.to {
                TierBound::UpTo(to) if i < last => remaining.min(to - floor),
                _ => remaining,
            };
            total += take / billing_units * tier.amount;
            remaining -= take;
            if let TierBound::UpTo(to) = tier.to {
                floor = to;
            }
        }
        total
    }))
}

/// Volume pricing: the whole quantity is charged at the rate of the single
/// tier containing it.
pub fn volume_tier_amount(
    tiers: &[UsageTier],
    quantity: Decimal,
    billing_units: Decimal,
    allowance: Decimal,
    allow_negative: bool,
) -> Result<Decimal, LedgerError> {
    let tiers = prepare(tiers, billing_units, allowance)?;
    let last = tiers.len() - 1;

    Ok(signed(quantity, allow_negative, |q| {
        let rounded = round_to_billing_units(q, billing_units);
        let tier = tiers
            .iter()
            .enumerate()
            .find(|(i, t)| match t.to {
                TierBound::UpTo(to) => *i == last || rounded <= to,
                TierBound::Infinite => true,
            })
            .map(|(_, t)| t)
            .unwrap_or(&tiers[last]);
        tier.amount / billing_units * rounded
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn three_tiers() -> Vec<UsageTier> {
        vec![
            UsageTier::up_to(dec("100"), dec("0.10")),
            UsageTier::up_to(dec("500"), dec("0.05")),
            UsageTier::infinite(dec("0.02")),
        ]
    }

    fn graduated(q: &str) -> Decimal {
        graduated_tier_amount(&three_tiers(), dec(q), Decimal::ONE, Decimal::ZERO, false).unwrap()
    }

    fn volume(q: &str) -> Decimal {
        volume_tier_amount(&three_tiers(), dec(q), Decimal::ONE, Decimal::ZERO, false).unwrap()
    }

    #[test]
    fn test_volume_and_graduated_differ_mid_tier() {
        assert_eq!(volume("250"), dec("12.50"));
        assert_eq!(graduated("250"), dec("17.50"));
    }

    #[test]
    fn test_graduated_walks_every_tier() {
        assert_eq!(graduated("50"), dec("5"));
        assert_eq!(graduated("100"), dec("10"));
        assert_eq!(graduated("500"), dec("30"));
        assert_eq!(graduated("1000"), dec("40"));
    }

    #[test]
    fn test_volume_tier_boundaries() {
        assert_eq!(volume("100"), dec("10"));
        assert_eq!(volume("101"), dec("5.05"));
        assert_eq!(volume("500"), dec("25"));
        assert_eq!(volume("1000"), dec("20"));
    }

    #[test]
    fn test_zero_quantity_is_free() {
        assert_eq!(graduated("0"), Decimal::ZERO);
        assert_eq!(volume("0"), Decimal::ZERO);
    }

    #[test]
    fn test_billing_units_round_up_before_tier_selection() {
        let tiers = vec![
            UsageTier::up_to(dec("100000"), dec("1")),
            UsageTier::infinite(dec("0.5")),
        ];
        let amount = |q: &str| {
            volume_tier_amount(&tiers, dec(q), dec("1000"), Decimal::ZERO, false).unwrap()
        };
        assert_eq!(amount("1500"), dec("2"));
        assert_eq!(amount("99500"), dec("100"));
        assert_eq!(amount("150000"), dec("75"));

        let flat = vec![UsageTier::infinite(dec("1"))];
        assert_eq!(
            graduated_tier_amount(&flat, dec("15"), dec("10"), Decimal::ZERO, false).unwrap(),
            dec("2")
        );
    }

    #[test]
    fn test_allowance_shifts_tiers() {
        let tiers = three_tiers();
        let volume_with = |q: &str| {
            volume_tier_amount(&tiers, dec(q), Decimal::ONE, dec("50"), false).unwrap()
        };
        assert_eq!(volume_with("30"), Decimal::ZERO);
        assert_eq!(volume_with("50"), Decimal::ZERO);
        assert_eq!(volume_with("51"), dec("5.10"));
        assert_eq!(volume_with("200"), dec("10"));

        // 50 free, then 100 @ .10, then 50 @ .05
        assert_eq!(
            graduated_tier_amount(&tiers, dec("200"), Decimal::ONE, dec("50"), false).unwrap(),
            dec("12.50")
        );
    }

    #[test]
    fn test_negative_quantity_requires_flag() {
        let tiers = three_tiers();
        assert_eq!(
            volume_tier_amount(&tiers, dec("-250"), Decimal::ONE, Decimal::ZERO, false).unwrap(),
            Decimal::ZERO
        );
        assert_eq!(
            volume_tier_amount(&tiers, dec("-250"), Decimal::ONE, Decimal::ZERO, true).unwrap(),
            dec("-12.50")
        );
        assert_eq!(
            graduated_tier_amount(&tiers, dec("-250"), Decimal::ONE, Decimal::ZERO, true).unwrap(),
            dec("-17.50")
        );
    }

    #[test]
    fn test_infinite_tier_matched_last_regardless_of_position() {
        let tiers = vec![
            UsageTier::infinite(dec("0.02")),
            UsageTier::up_to(dec("100"), dec("0.10")),
            UsageTier::up_to(dec("500"), dec("0.05")),
        ];
        assert_eq!(
            volume_tier_amount(&tiers, dec("250"), Decimal::ONE, Decimal::ZERO, false).unwrap(),
            dec("12.50")
        );
    }

    #[test]
    fn test_invalid_tiers() {
        assert!(matches!(
            graduated_tier_amount(&[], dec("1"), Decimal::ONE, Decimal::ZERO, false),
            Err(LedgerError::Config(_))
        ));

        let unordered = vec![
            UsageTier::up_to(dec("500"), dec("0.05")),
            UsageTier::up_to(dec("100"), dec("0.10")),
        ];
        assert!(matches!(
            volume_tier_amount(&unordered, dec("1"), Decimal::ONE, Decimal::ZERO, false),
            Err(LedgerError::Validation(_))
        ));

        assert!(matches!(
            volume_tier_amount(&three_tiers(), dec("1"), Decimal::ZERO, Decimal::ZERO, false),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_tiny_rates_keep_precision() {
        let tiers = vec![UsageTier::infinite(dec("0.000001"))];
        assert_eq!(
            graduated_tier_amount(&tiers, dec("1000000"), Decimal::ONE, Decimal::ZERO, false)
                .unwrap(),
            Decimal::ONE
        );
        let tiers = vec![UsageTier::infinite(dec("0.1"))];
        assert_eq!(
            volume_tier_amount(&tiers, dec("3"), Decimal::ONE, Decimal::ZERO, false).unwrap(),
            dec("0.3")
        );
    }
}
