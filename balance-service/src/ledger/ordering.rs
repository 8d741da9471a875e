//! The single deduction/refund/display order for breakdowns.

use crate::models::{Breakdown, Rollover};
use std::cmp::Ordering;

/// Overage-allowed breakdowns last, then finer reset intervals first, then
/// oldest first. The id makes the order total.
pub fn canonical_cmp(a: &Breakdown, b: &Breakdown) -> Ordering {
    a.overage_allowed
        .cmp(&b.overage_allowed)
        .then_with(|| a.reset_interval.cmp(&b.reset_interval))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_canonical(breakdowns: &mut [Breakdown]) {
    breakdowns.sort_by(canonical_cmp);
}

/// Rollovers closest to expiry are consumed first; non-expiring ones last.
pub fn rollover_cmp(a: &Rollover, b: &Rollover) -> Ordering {
    match (a.expires_at, b.expires_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::test_support::breakdown;
    use crate::models::ResetInterval;
    use chrono::Duration;

    #[test]
    fn test_overage_last_then_interval_then_age() {
        let lifetime = breakdown(ResetInterval::Lifetime, 200);
        let monthly = breakdown(ResetInterval::Month, 100);
        let mut overage = breakdown(ResetInterval::Hour, 10);
        overage.overage_allowed = true;
        let mut older_month = breakdown(ResetInterval::Month, 50);
        older_month.created_at = monthly.created_at - Duration::days(1);

        let mut all = vec![
            overage.clone(),
            lifetime.clone(),
            monthly.clone(),
            older_month.clone(),
        ];
        sort_canonical(&mut all);

        let ids: Vec<_> = all.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![older_month.id, monthly.id, lifetime.id, overage.id]);
    }

    #[test]
    fn test_one_off_after_lifetime() {
        let one_off = breakdown(ResetInterval::OneOff, 1);
        let lifetime = breakdown(ResetInterval::Lifetime, 1);
        assert_eq!(canonical_cmp(&lifetime, &one_off), Ordering::Less);
    }
}
