//! Rollover carryover at cycle reset and plan switch.

use crate::models::{Breakdown, Rollover, RolloverConfig};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Amount carried out of a cycle. Nothing carries without a policy.
pub fn reset_carryover(leftover: Decimal, config: Option<&RolloverConfig>) -> Decimal {
    match config {
        Some(cfg) => cfg.cap(leftover.max(Decimal::ZERO)),
        None => Decimal::ZERO,
    }
}

/// Amount carried across a plan switch: capped by both plans, and zero when
/// the destination plan has no rollover policy.
pub fn switch_carryover(
    leftover: Decimal,
    source: Option<&RolloverConfig>,
    destination: Option<&RolloverConfig>,
) -> Decimal {
    let Some(dst) = destination else {
        return Decimal::ZERO;
    };
    let from_source = source.map_or(leftover, |src| src.cap(leftover));
    dst.cap(from_source.max(Decimal::ZERO))
}

/// Drop rollovers that have expired at `now`. Returns how many were removed.
pub fn prune_expired(b: &mut Breakdown, now: DateTime<Utc>) -> usize {
    let before = b.rollovers.len();
    b.rollovers.retain(|r| r.is_active(now));
    before - b.rollovers.len()
}

/// Reset `b` if its boundary has passed.
///
/// Leftover current balance becomes a rollover per the breakdown's policy,
/// the allowance is restored and `next_reset_at` moves past `now`. Returns
/// the rollover created, if any.
pub fn reset_breakdown(b: &mut Breakdown, now: DateTime<Utc>) -> Option<Rollover> {
    let boundary = b.next_reset_at?;
    if boundary > now || !b.reset_interval.resets() {
        return None;
    }

    prune_expired(b, now);

    let carried = reset_carryover(b.current_balance, b.rollover_config.as_ref());
    let rollover = match &b.rollover_config {
        Some(cfg) if carried > Decimal::ZERO => {
            let r = Rollover {
                id: Uuid::new_v4(),
                breakdown_id: b.id,
                balance: carried,
                usage: Decimal::ZERO,
                expires_at: cfg.expires_at(boundary),
            };
            r.is_active(now).then_some(r)
        }
        _ => None,
    };
    if let Some(r) = &rollover {
        b.rollovers.push(r.clone());
    }

    b.current_balance = b.granted_balance.max(Decimal::ZERO);
    b.purchased_balance = b.current_balance - b.granted_balance;
    b.usage = Decimal::ZERO;

    let mut next = boundary;
    while next <= now {
        match b.reset_interval.advance(next) {
            Some(n) => next = n,
            None => break,
        }
    }
    b.next_reset_at = Some(next);

    rollover
}

/// Reset every due breakdown. Returns the number reset.
pub fn reset_due(breakdowns: &mut [Breakdown], now: DateTime<Utc>) -> usize {
    let mut reset = 0;
    for b in breakdowns.iter_mut() {
        if b.reset_interval.resets() && b.next_reset_at.is_some_and(|at| at <= now) {
            reset_breakdown(b, now);
            reset += 1;
        }
    }
    reset
}

/// Move active rollover credit from `sources` to `destination`, capped per
/// [`switch_carryover`]. Source rollovers are removed whether or not any
/// credit survives. Returns the amount carried.
pub fn transfer_rollovers(
    sources: &mut [Breakdown],
    destination: &mut Breakdown,
    now: DateTime<Utc>,
) -> Decimal {
    let leftover: Decimal = sources.iter().map(|b| b.active_rollover_balance(now)).sum();
    let source_config = sources.iter().find_map(|b| b.rollover_config.clone());
    let carried = switch_carryover(
        leftover,
        source_config.as_ref(),
        destination.rollover_config.as_ref(),
    );

    for b in sources.iter_mut() {
        b.rollovers.clear();
    }

    if carried > Decimal::ZERO {
        if let Some(cfg) = &destination.rollover_config {
            destination.rollovers.push(Rollover {
                id: Uuid::new_v4(),
                breakdown_id: destination.id,
                balance: carried,
                usage: Decimal::ZERO,
                expires_at: cfg.expires_at(now),
            });
        }
    }
    carried
}
