//! Applying usage deltas across ordered breakdowns.
//!
//! Consumption and refund walk the same canonical order. Active rollover
//! credit is spent before any breakdown and restored after them.

use crate::ledger::ordering::rollover_cmp;
use crate::models::Breakdown;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Result of applying a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageOutcome {
    /// Magnitude actually deducted or refunded.
    pub applied: Decimal,
    /// Magnitude that had nowhere to go: usage beyond the last non-overage
    /// breakdown, or a refund larger than what was consumed.
    pub unapplied: Decimal,
}

/// Apply `delta` to `breakdowns`, which must already be in canonical order.
/// Positive values consume, negative values refund.
pub fn apply_usage(breakdowns: &mut [Breakdown], delta: Decimal, now: DateTime<Utc>) -> UsageOutcome {
    let amount = delta.abs();
    let remaining = if delta > Decimal::ZERO {
        let left = consume_rollovers(breakdowns, amount, now);
        drain(breakdowns, left, true)
    } else if delta < Decimal::ZERO {
        let left = fill(breakdowns, amount);
        restore_rollovers(breakdowns, left, now)
    } else {
        Decimal::ZERO
    };

    UsageOutcome {
        applied: amount - remaining,
        unapplied: remaining,
    }
}

/// Consume up to `amount` from breakdown balances. With `book_overage`,
/// whatever the breakdowns cannot cover lands on the last one as purchased
/// overage when it allows overage. Returns the part left over.
pub(crate) fn drain(breakdowns: &mut [Breakdown], amount: Decimal, book_overage: bool) -> Decimal {
    let mut remaining = amount;

    for b in breakdowns.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let taken = b.current_balance.max(Decimal::ZERO).min(remaining);
        b.current_balance -= taken;
        b.usage += taken;
        remaining -= taken;
    }

    if book_overage && remaining > Decimal::ZERO {
        if let Some(last) = breakdowns.last_mut() {
            if last.overage_allowed {
                last.purchased_balance += remaining;
                last.usage += remaining;
                remaining = Decimal::ZERO;
            }
        }
    }

    remaining
}

/// Give back up to `amount`: first clear purchased overage in order, then
/// raise current balances toward their granted ceiling in order. Returns the
/// part left over.
pub(crate) fn fill(breakdowns: &mut [Breakdown], amount: Decimal) -> Decimal {
    let mut remaining = amount;

    for b in breakdowns.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let given = b.purchased_balance.max(Decimal::ZERO).min(remaining);
        b.purchased_balance -= given;
        b.usage -= given;
        remaining -= given;
    }

    for b in breakdowns.iter_mut() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let headroom = (b.granted_balance - b.current_balance).max(Decimal::ZERO);
        let given = headroom.min(remaining);
        b.current_balance += given;
        b.usage -= given;
        remaining -= given;
    }

    remaining
}

/// (breakdown index, rollover index) pairs of active rollovers, soonest to
/// expire first.
fn rollover_slots(breakdowns: &[Breakdown], now: DateTime<Utc>) -> Vec<(usize, usize)> {
    let mut slots: Vec<(usize, usize)> = breakdowns
        .iter()
        .enumerate()
        .flat_map(|(bi, b)| {
            b.rollovers
                .iter()
                .enumerate()
                .filter(move |(_, r)| r.is_active(now))
                .map(move |(ri, _)| (bi, ri))
        })
        .collect();
    slots.sort_by(|a, b| {
        rollover_cmp(
            &breakdowns[a.0].rollovers[a.1],
            &breakdowns[b.0].rollovers[b.1],
        )
    });
    slots
}

fn consume_rollovers(breakdowns: &mut [Breakdown], amount: Decimal, now: DateTime<Utc>) -> Decimal {
    let mut remaining = amount;
    for (bi, ri) in rollover_slots(breakdowns, now) {
        if remaining <= Decimal::ZERO {
            break;
        }
        let r = &mut breakdowns[bi].rollovers[ri];
        let taken = r.balance.max(Decimal::ZERO).min(remaining);
        r.balance -= taken;
        r.usage += taken;
        remaining -= taken;
    }
    remaining
}

fn restore_rollovers(breakdowns: &mut [Breakdown], amount: Decimal, now: DateTime<Utc>) -> Decimal {
    let mut remaining = amount;
    for (bi, ri) in rollover_slots(breakdowns, now) {
        if remaining <= Decimal::ZERO {
            break;
        }
        let r = &mut breakdowns[bi].rollovers[ri];
        let given = r.usage.max(Decimal::ZERO).min(remaining);
        r.balance += given;
        r.usage -= given;
        remaining -= given;
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::{breakdown, dec};
    use crate::models::{AggregateBalance, ResetInterval, Rollover};
    use chrono::Duration;
    use uuid::Uuid;

    fn fields(b: &Breakdown) -> (Decimal, Decimal, Decimal, Decimal) {
        (
            b.granted_balance,
            b.current_balance,
            b.purchased_balance,
            b.usage,
        )
    }

    fn monthly_and_lifetime() -> Vec<Breakdown> {
        vec![
            breakdown(ResetInterval::Month, 100),
            breakdown(ResetInterval::Lifetime, 200),
        ]
    }

    #[test]
    fn test_track_spills_then_refunds_earliest_first() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();

        let out = apply_usage(&mut bs, dec("250"), now);
        assert_eq!(out.applied, dec("250"));
        assert_eq!(bs[0].current_balance, dec("0"));
        assert_eq!(bs[0].usage, dec("100"));
        assert_eq!(bs[1].current_balance, dec("50"));
        assert_eq!(bs[1].usage, dec("150"));

        apply_usage(&mut bs, dec("-30"), now);
        assert_eq!(bs[0].current_balance, dec("30"));
        assert_eq!(bs[0].usage, dec("70"));
        assert_eq!(bs[1].current_balance, dec("50"));
        assert!(bs.iter().all(Breakdown::is_consistent));
    }

    #[test]
    fn test_round_trip_restores_fields() {
        let now = Utc::now();
        for amount in ["1", "99.5", "100", "250", "300", "1000"] {
            let mut bs = monthly_and_lifetime();
            bs[1].overage_allowed = true;
            let before: Vec<_> = bs.iter().map(fields).collect();

            apply_usage(&mut bs, dec(amount), now);
            let out = apply_usage(&mut bs, -dec(amount), now);

            assert_eq!(out.unapplied, Decimal::ZERO, "amount {}", amount);
            let after: Vec<_> = bs.iter().map(fields).collect();
            assert_eq!(before, after, "amount {}", amount);
        }
    }

    #[test]
    fn test_overage_accrues_on_last_breakdown() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();
        bs[1].overage_allowed = true;

        let out = apply_usage(&mut bs, dec("350"), now);
        assert_eq!(out.unapplied, Decimal::ZERO);
        assert_eq!(bs[1].current_balance, Decimal::ZERO);
        assert_eq!(bs[1].purchased_balance, dec("50"));
        assert_eq!(bs[1].usage, dec("250"));
        assert!(bs.iter().all(Breakdown::is_consistent));

        // purchased overage is cleared before any current balance returns
        apply_usage(&mut bs, dec("-60"), now);
        assert_eq!(bs[1].purchased_balance, Decimal::ZERO);
        assert_eq!(bs[0].current_balance, dec("10"));
    }

    #[test]
    fn test_without_overage_excess_is_unapplied() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();
        let out = apply_usage(&mut bs, dec("320"), now);
        assert_eq!(out.applied, dec("300"));
        assert_eq!(out.unapplied, dec("20"));
        assert!(bs.iter().all(|b| b.current_balance >= Decimal::ZERO));
        assert!(bs.iter().all(|b| b.purchased_balance.is_zero()));
    }

    #[test]
    fn test_refund_beyond_usage_is_capped() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();
        apply_usage(&mut bs, dec("10"), now);
        let out = apply_usage(&mut bs, dec("-25"), now);
        assert_eq!(out.applied, dec("10"));
        assert_eq!(out.unapplied, dec("15"));
        assert_eq!(bs[0].current_balance, dec("100"));
    }

    #[test]
    fn test_rollovers_consumed_first_and_restored_last() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();
        let soon = Rollover {
            id: Uuid::new_v4(),
            breakdown_id: bs[1].id,
            balance: dec("20"),
            usage: Decimal::ZERO,
            expires_at: Some(now + Duration::days(3)),
        };
        let later = Rollover {
            id: Uuid::new_v4(),
            breakdown_id: bs[0].id,
            balance: dec("20"),
            usage: Decimal::ZERO,
            expires_at: None,
        };
        let expired = Rollover {
            id: Uuid::new_v4(),
            breakdown_id: bs[0].id,
            balance: dec("500"),
            usage: Decimal::ZERO,
            expires_at: Some(now - Duration::days(1)),
        };
        bs[1].rollovers.push(soon);
        bs[0].rollovers.push(later);
        bs[0].rollovers.push(expired);

        apply_usage(&mut bs, dec("30"), now);
        assert_eq!(bs[1].rollovers[0].balance, Decimal::ZERO);
        assert_eq!(bs[0].rollovers[0].balance, dec("10"));
        assert_eq!(bs[0].rollovers[1].balance, dec("500"));
        assert_eq!(bs[0].current_balance, dec("100"));

        let agg = AggregateBalance::from_breakdowns(&bs, now);
        assert_eq!(agg.rollover_balance, dec("10"));
        assert_eq!(agg.current_balance, dec("300"));

        apply_usage(&mut bs, dec("-30"), now);
        assert_eq!(bs[1].rollovers[0].balance, dec("20"));
        assert_eq!(bs[0].rollovers[0].balance, dec("20"));
    }

    #[test]
    fn test_aggregate_sums_breakdowns() {
        let now = Utc::now();
        let mut bs = monthly_and_lifetime();
        bs.push(breakdown(ResetInterval::Day, 7));
        apply_usage(&mut bs, dec("42"), now);

        let agg = AggregateBalance::from_breakdowns(&bs, now);
        assert_eq!(
            agg.current_balance,
            bs.iter().map(|b| b.current_balance).sum::<Decimal>()
        );
        assert_eq!(
            agg.granted_balance,
            bs.iter().map(|b| b.granted_balance).sum::<Decimal>()
        );
        assert_eq!(agg.usage, dec("42"));
    }

    #[test]
    fn test_zero_delta_is_noop() {
        let mut bs = monthly_and_lifetime();
        let before: Vec<_> = bs.iter().map(fields).collect();
        let out = apply_usage(&mut bs, Decimal::ZERO, Utc::now());
        assert_eq!(out, UsageOutcome::default());
        assert_eq!(before, bs.iter().map(fields).collect::<Vec<_>>());
    }
}
