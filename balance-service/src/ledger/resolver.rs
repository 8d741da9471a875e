//! Feature grant resolution.

use crate::error::LedgerError;
use crate::ledger::ordering::sort_canonical;
use crate::models::{Breakdown, FeatureLedger, GrantScope};
use chrono::{DateTime, Utc};

/// Breakdowns of `ledger` that apply to the customer, or to one of its
/// entities, at `now`, in canonical order.
///
/// With an entity, customer-scoped grants apply together with that entity's
/// own grants whose `entity_feature_id` is unset or matches the entity's
/// feature type. Without one, every entity grant rolls up to the customer.
pub fn resolve(
    ledger: &FeatureLedger,
    entity_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<Breakdown>, LedgerError> {
    let entity = match entity_id {
        Some(id) => Some(ledger.entity(id).ok_or_else(|| {
            LedgerError::not_found(format!(
                "entity '{}' for customer '{}'",
                id, ledger.customer_id
            ))
        })?),
        None => None,
    };

    let mut resolved: Vec<Breakdown> = ledger
        .breakdowns
        .iter()
        .filter(|b| {
            ledger
                .product(b.customer_product_id)
                .is_some_and(|p| p.is_active(now))
        })
        .filter(|b| match (&b.scope, entity) {
            (GrantScope::Customer, _) => true,
            (GrantScope::Entity { .. }, None) => true,
            (GrantScope::Entity { entity_id }, Some(e)) => {
                *entity_id == e.entity_id
                    && b
                        .entity_feature_id
                        .as_ref()
                        .map_or(true, |f| *f == e.feature_id)
            }
        })
        .cloned()
        .collect();

    sort_canonical(&mut resolved);
    Ok(resolved)
}
