//! Direct balance updates: explicit sets of current, granted or usage.

use crate::error::LedgerError;
use crate::ledger::deduction::{drain, fill};
use crate::models::{BalanceUpdate, Breakdown, FeatureLedger};
use rust_decimal::Decimal;

/// Set `current_balance` on one breakdown, recomputing usage.
///
/// A negative target cannot be represented directly: current floors at zero,
/// granted drops by the deficit and the deficit is added to purchased
/// overage. Overage already accrued is kept. A target that would leave usage
/// negative is rejected.
pub fn set_current(b: &mut Breakdown, current: Decimal) -> Result<(), LedgerError> {
    let ceiling = b.granted_balance + b.purchased_balance;
    if current > ceiling {
        return Err(LedgerError::validation(format!(
            "current balance {} exceeds the {} available on breakdown {}",
            current, ceiling, b.id
        )));
    }

    if current >= Decimal::ZERO {
        b.current_balance = current;
        b.usage = ceiling - current;
        return Ok(());
    }

    let deficit = -current;
    let granted = b.granted_balance - deficit;
    if granted < Decimal::ZERO && !b.overage_allowed {
        return Err(LedgerError::validation(format!(
            "granted balance of breakdown {} cannot go negative",
            b.id
        )));
    }
    b.granted_balance = granted;
    b.current_balance = Decimal::ZERO;
    b.purchased_balance += deficit;
    b.usage = b.granted_balance + b.purchased_balance;
    Ok(())
}

/// Equivalent to `set_current(granted + purchased - usage)`.
pub fn set_usage(b: &mut Breakdown, usage: Decimal) -> Result<(), LedgerError> {
    if usage < Decimal::ZERO {
        return Err(LedgerError::validation("usage must not be negative"));
    }
    let current = b.granted_balance + b.purchased_balance - usage;
    set_current(b, current)
}

/// Set granted and current together; usage follows.
pub fn set_granted_and_current(
    b: &mut Breakdown,
    granted: Decimal,
    current: Decimal,
) -> Result<(), LedgerError> {
    if granted < Decimal::ZERO && !b.overage_allowed {
        return Err(LedgerError::validation(format!(
            "granted balance of breakdown {} cannot go negative",
            b.id
        )));
    }
    if current < Decimal::ZERO || current > granted + b.purchased_balance {
        return Err(LedgerError::validation(format!(
            "current balance {} must lie within [0, {}]",
            current,
            granted + b.purchased_balance
        )));
    }
    b.granted_balance = granted;
    b.current_balance = current;
    b.usage = granted + b.purchased_balance - current;
    Ok(())
}

/// Change the allowance while keeping recorded usage. Usage above the new
/// allowance becomes purchased overage.
pub fn set_granted(b: &mut Breakdown, granted: Decimal) -> Result<(), LedgerError> {
    if granted < Decimal::ZERO && !b.overage_allowed {
        return Err(LedgerError::validation(format!(
            "granted balance of breakdown {} cannot go negative",
            b.id
        )));
    }
    b.granted_balance = granted;
    if b.usage <= granted {
        b.current_balance = granted - b.usage;
        b.purchased_balance = Decimal::ZERO;
    } else {
        b.current_balance = Decimal::ZERO;
        b.purchased_balance = b.usage - granted;
    }
    Ok(())
}

/// Move the summed current balance of `targets` to `total`, walking them in
/// order. A drain deeper than every balance is charged to the last target
/// through [`set_current`]; a fill beyond every granted ceiling is rejected.
pub fn distribute_current(targets: &mut [Breakdown], total: Decimal) -> Result<(), LedgerError> {
    let held: Decimal = targets.iter().map(|b| b.current_balance).sum();
    let delta = total - held;

    if delta < Decimal::ZERO {
        let deficit = drain(targets, -delta, false);
        if deficit > Decimal::ZERO {
            let Some(last) = targets.last_mut() else {
                return Err(LedgerError::not_found("no breakdowns to update"));
            };
            let target = last.current_balance - deficit;
            set_current(last, target)?;
        }
    } else if delta > Decimal::ZERO {
        let excess = fill(targets, delta);
        if excess > Decimal::ZERO {
            return Err(LedgerError::validation(format!(
                "target current balance {} exceeds granted allowance by {}",
                total, excess
            )));
        }
    }
    Ok(())
}

/// Apply `update` to `resolved`, the canonical breakdowns in the caller's
/// scope. `ledger` distinguishes unknown breakdown ids from ids outside the
/// scope.
pub fn apply_update(
    ledger: &FeatureLedger,
    resolved: &mut [Breakdown],
    update: &BalanceUpdate,
) -> Result<(), LedgerError> {
    if update.current_balance.is_some() && update.usage.is_some() {
        return Err(LedgerError::validation(
            "current_balance and usage cannot be set together",
        ));
    }
    if update.current_balance.is_none()
        && update.usage.is_none()
        && update.granted_balance.is_none()
        && update.next_reset_at.is_none()
    {
        return Err(LedgerError::validation("balance update sets no fields"));
    }

    if let Some(id) = update.breakdown_id {
        let Some(target) = resolved.iter_mut().find(|b| b.id == id) else {
            return Err(if ledger.breakdown(id).is_some() {
                LedgerError::invalid_scope(format!(
                    "breakdown {} does not apply to the requested customer or entity",
                    id
                ))
            } else {
                LedgerError::not_found(format!("breakdown {}", id))
            });
        };
        if let Some(interval) = update.interval_filter {
            if target.reset_interval != interval {
                return Err(LedgerError::invalid_scope(format!(
                    "breakdown {} resets {} not {}",
                    id, target.reset_interval, interval
                )));
            }
        }
        return apply_single(target, update);
    }

    let mut targets: Vec<&mut Breakdown> = resolved
        .iter_mut()
        .filter(|b| update.interval_filter.map_or(true, |i| b.reset_interval == i))
        .collect();
    if targets.is_empty() {
        return Err(LedgerError::not_found(match update.interval_filter {
            Some(i) => format!("no {} breakdowns for feature '{}'", i, ledger.feature.feature_id),
            None => format!("no breakdowns for feature '{}'", ledger.feature.feature_id),
        }));
    }

    if update.granted_balance.is_some() {
        if targets.len() != 1 {
            return Err(LedgerError::validation(
                "granted_balance needs a breakdown_id when several breakdowns match",
            ));
        }
        return apply_single(&mut *targets[0], update);
    }

    if let Some(at) = update.next_reset_at {
        for b in targets.iter_mut() {
            b.next_reset_at = Some(at);
        }
    }

    let total = match (update.current_balance, update.usage) {
        (Some(current), _) => Some(current),
        (None, Some(usage)) => {
            if usage < Decimal::ZERO {
                return Err(LedgerError::validation("usage must not be negative"));
            }
            let ceiling: Decimal = targets
                .iter()
                .map(|b| b.granted_balance + b.purchased_balance)
                .sum();
            Some(ceiling - usage)
        }
        (None, None) => None,
    };

    if let Some(total) = total {
        let mut owned: Vec<Breakdown> = targets.iter().map(|b| (**b).clone()).collect();
        distribute_current(&mut owned, total)?;
        for (slot, updated) in targets.into_iter().zip(owned) {
            *slot = updated;
        }
    }
    Ok(())
}

fn apply_single(b: &mut Breakdown, update: &BalanceUpdate) -> Result<(), LedgerError> {
    match (update.granted_balance, update.current_balance, update.usage) {
        (Some(granted), Some(current), _) => set_granted_and_current(b, granted, current)?,
        (Some(granted), None, Some(usage)) => {
            set_granted(b, granted)?;
            set_usage(b, usage)?;
        }
        (Some(granted), None, None) => set_granted(b, granted)?,
        (None, Some(current), _) => set_current(b, current)?,
        (None, None, Some(usage)) => set_usage(b, usage)?,
        (None, None, None) => {}
    }
    if let Some(at) = update.next_reset_at {
        b.next_reset_at = Some(at);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{breakdown, dec, ledger_with};
    use crate::models::ResetInterval;
    use uuid::Uuid;

    #[test]
    fn test_set_current_recomputes_usage() {
        let mut b = breakdown(ResetInterval::Month, 100);
        set_current(&mut b, dec("40")).unwrap();
        assert_eq!(b.usage, dec("60"));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_negative_current_becomes_overage() {
        let mut b = breakdown(ResetInterval::Month, 100);
        set_current(&mut b, dec("-30")).unwrap();
        assert_eq!(b.current_balance, Decimal::ZERO);
        assert_eq!(b.granted_balance, dec("70"));
        assert_eq!(b.purchased_balance, dec("30"));
        assert_eq!(b.usage, dec("100"));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_negative_current_adds_to_existing_overage() {
        let mut b = breakdown(ResetInterval::Month, 100);
        b.overage_allowed = true;
        let mut bs = vec![b];
        crate::ledger::deduction::apply_usage(&mut bs, dec("130"), chrono::Utc::now());
        let mut b = bs.remove(0);
        assert_eq!(b.purchased_balance, dec("30"));
        assert_eq!(b.usage, dec("130"));

        set_current(&mut b, dec("-20")).unwrap();
        assert_eq!(b.granted_balance, dec("80"));
        assert_eq!(b.current_balance, Decimal::ZERO);
        assert_eq!(b.purchased_balance, dec("50"));
        assert_eq!(b.usage, dec("130"));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_set_current_keeps_overage_on_positive_target() {
        let mut b = breakdown(ResetInterval::Month, 100);
        b.current_balance = Decimal::ZERO;
        b.purchased_balance = dec("30");
        b.usage = dec("130");

        set_current(&mut b, dec("40")).unwrap();
        assert_eq!(b.purchased_balance, dec("30"));
        assert_eq!(b.usage, dec("90"));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_current_above_available_rejected() {
        let mut b = breakdown(ResetInterval::Month, 100);
        assert!(matches!(
            set_current(&mut b, dec("101")),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(b.current_balance, dec("100"));
        assert_eq!(b.usage, Decimal::ZERO);
    }

    #[test]
    fn test_negative_granted_rejected_without_overage() {
        let mut b = breakdown(ResetInterval::Month, 10);
        assert!(matches!(
            set_current(&mut b, dec("-30")),
            Err(LedgerError::Validation(_))
        ));

        let mut b = breakdown(ResetInterval::Month, 10);
        b.overage_allowed = true;
        set_current(&mut b, dec("-30")).unwrap();
        assert_eq!(b.granted_balance, dec("-20"));
        assert!(b.is_consistent());

        let mut b = breakdown(ResetInterval::Month, 10);
        assert!(set_granted_and_current(&mut b, dec("-1"), Decimal::ZERO).is_err());
    }

    #[test]
    fn test_set_usage_matches_set_current() {
        let mut a = breakdown(ResetInterval::Month, 100);
        let mut b = a.clone();
        set_usage(&mut a, dec("130")).unwrap();
        set_current(&mut b, dec("-30")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_granted_and_current_together() {
        let mut b = breakdown(ResetInterval::Month, 100);
        set_granted_and_current(&mut b, dec("500"), dec("450")).unwrap();
        assert_eq!(b.usage, dec("50"));
        assert!(set_granted_and_current(&mut b, dec("10"), dec("20")).is_err());
    }

    #[test]
    fn test_set_granted_keeps_usage() {
        let mut b = breakdown(ResetInterval::Month, 100);
        set_current(&mut b, dec("20")).unwrap();
        set_granted(&mut b, dec("50")).unwrap();
        assert_eq!(b.usage, dec("80"));
        assert_eq!(b.current_balance, Decimal::ZERO);
        assert_eq!(b.purchased_balance, dec("30"));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_bulk_drain_is_sequential() {
        let mut bs = vec![
            breakdown(ResetInterval::Month, 100),
            breakdown(ResetInterval::Lifetime, 200),
        ];
        distribute_current(&mut bs, dec("150")).unwrap();
        assert_eq!(bs[0].current_balance, Decimal::ZERO);
        assert_eq!(bs[1].current_balance, dec("150"));

        distribute_current(&mut bs, dec("260")).unwrap();
        assert_eq!(bs[0].current_balance, dec("100"));
        assert_eq!(bs[1].current_balance, dec("160"));

        assert!(distribute_current(&mut bs, dec("301")).is_err());
    }

    #[test]
    fn test_bulk_deficit_lands_on_last() {
        let mut bs = vec![
            breakdown(ResetInterval::Month, 100),
            breakdown(ResetInterval::Lifetime, 200),
        ];
        bs[1].overage_allowed = true;
        distribute_current(&mut bs, dec("-25")).unwrap();
        assert_eq!(bs[0].current_balance, Decimal::ZERO);
        assert_eq!(bs[1].current_balance, Decimal::ZERO);
        assert_eq!(bs[1].purchased_balance, dec("25"));
        assert!(bs.iter().all(Breakdown::is_consistent));
    }

    #[test]
    fn test_update_scope_errors() {
        let inside = breakdown(ResetInterval::Month, 100);
        let outside = breakdown(ResetInterval::Month, 100);
        let ledger = ledger_with(vec![inside.clone(), outside.clone()]);
        let mut resolved = vec![inside.clone()];

        let update = BalanceUpdate {
            breakdown_id: Some(outside.id),
            current_balance: Some(dec("1")),
            ..Default::default()
        };
        assert!(matches!(
            apply_update(&ledger, &mut resolved, &update),
            Err(LedgerError::InvalidScope(_))
        ));

        let update = BalanceUpdate {
            breakdown_id: Some(Uuid::new_v4()),
            current_balance: Some(dec("1")),
            ..Default::default()
        };
        assert!(matches!(
            apply_update(&ledger, &mut resolved, &update),
            Err(LedgerError::NotFound(_))
        ));

        let update = BalanceUpdate {
            current_balance: Some(dec("1")),
            usage: Some(dec("1")),
            ..Default::default()
        };
        assert!(matches!(
            apply_update(&ledger, &mut resolved, &update),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_interval_filtered_usage_update() {
        let month = breakdown(ResetInterval::Month, 100);
        let lifetime = breakdown(ResetInterval::Lifetime, 200);
        let ledger = ledger_with(vec![month.clone(), lifetime.clone()]);
        let mut resolved = vec![month, lifetime];

        let update = BalanceUpdate {
            usage: Some(dec("30")),
            interval_filter: Some(ResetInterval::Lifetime),
            ..Default::default()
        };
        apply_update(&ledger, &mut resolved, &update).unwrap();
        assert_eq!(resolved[0].usage, Decimal::ZERO);
        assert_eq!(resolved[1].current_balance, dec("170"));

        let update = BalanceUpdate {
            granted_balance: Some(dec("500")),
            ..Default::default()
        };
        assert!(matches!(
            apply_update(&ledger, &mut resolved, &update),
            Err(LedgerError::Validation(_))
        ));
    }
}
