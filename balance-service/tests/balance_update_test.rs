//! Balance update integration tests: explicit sets on one breakdown or a scope.

mod common;

use balance_service::error::LedgerError;
use balance_service::models::{BalanceUpdate, CheckRequest, CheckResponse, ResetInterval};
use chrono::{Duration, Utc};
use common::{dec, grant, spawn_ledger, TestLedger, CUSTOMER, FEATURE};
use rust_decimal::Decimal;
use uuid::Uuid;

fn update() -> BalanceUpdate {
    BalanceUpdate {
        customer_id: CUSTOMER.to_string(),
        feature_id: FEATURE.to_string(),
        ..Default::default()
    }
}

async fn check(ledger: &TestLedger) -> CheckResponse {
    ledger
        .service
        .check(CheckRequest {
            customer_id: CUSTOMER.to_string(),
            feature_id: FEATURE.to_string(),
            entity_id: None,
            bypass_cache: false,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn negative_current_becomes_purchased_overage() {
    let ledger = spawn_ledger().await;
    let b = ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();

    ledger
        .service
        .update_balance(BalanceUpdate {
            breakdown_id: Some(b.id),
            current_balance: Some(dec("-20")),
            ..update()
        })
        .await
        .unwrap();

    let view = &check(&ledger).await.breakdowns[0];
    assert_eq!(view.current_balance, Decimal::ZERO);
    assert_eq!(view.granted_balance, dec("80"));
    assert_eq!(view.purchased_balance, dec("20"));
    assert_eq!(view.usage, dec("100"));
}

#[tokio::test]
async fn interval_update_drains_earliest_breakdown_first() {
    let ledger = spawn_ledger().await;
    for plan in ["pro", "addon"] {
        ledger
            .service
            .create_grant(grant(plan, ResetInterval::Month, 100))
            .await
            .unwrap();
    }
    ledger
        .service
        .create_grant(grant("topup", ResetInterval::Lifetime, 200))
        .await
        .unwrap();

    let balance = ledger
        .service
        .update_balance(BalanceUpdate {
            current_balance: Some(dec("150")),
            interval_filter: Some(ResetInterval::Month),
            ..update()
        })
        .await
        .unwrap();
    assert_eq!(balance.current_balance, dec("350"));

    let response = check(&ledger).await;
    let currents: Vec<Decimal> = response.breakdowns.iter().map(|b| b.current_balance).collect();
    assert_eq!(currents, vec![dec("50"), dec("100"), dec("200")]);
    assert_eq!(response.breakdowns[0].usage, dec("50"));
}

#[tokio::test]
async fn customer_usage_set_spreads_in_canonical_order() {
    let ledger = spawn_ledger().await;
    ledger
        .service
        .create_grant(grant("topup", ResetInterval::Lifetime, 200))
        .await
        .unwrap();
    ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();

    let balance = ledger
        .service
        .update_balance(BalanceUpdate {
            usage: Some(dec("130")),
            ..update()
        })
        .await
        .unwrap();
    assert_eq!(balance.usage, dec("130"));

    let response = check(&ledger).await;
    assert_eq!(response.breakdowns[0].reset_interval, ResetInterval::Month);
    assert_eq!(response.breakdowns[0].current_balance, Decimal::ZERO);
    assert_eq!(response.breakdowns[1].current_balance, dec("170"));
}

#[tokio::test]
async fn granted_and_current_set_together() {
    let ledger = spawn_ledger().await;
    let b = ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();

    ledger
        .service
        .update_balance(BalanceUpdate {
            breakdown_id: Some(b.id),
            granted_balance: Some(dec("500")),
            current_balance: Some(dec("450")),
            ..update()
        })
        .await
        .unwrap();

    let view = &check(&ledger).await.breakdowns[0];
    assert_eq!(view.granted_balance, dec("500"));
    assert_eq!(view.current_balance, dec("450"));
    assert_eq!(view.usage, dec("50"));
}

#[tokio::test]
async fn next_reset_moves_without_touching_balances() {
    let ledger = spawn_ledger().await;
    ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();
    let at = Utc::now() + Duration::days(3);

    ledger
        .service
        .update_balance(BalanceUpdate {
            next_reset_at: Some(at),
            ..update()
        })
        .await
        .unwrap();

    let view = &check(&ledger).await.breakdowns[0];
    assert_eq!(view.next_reset_at, Some(at));
    assert_eq!(view.current_balance, dec("100"));
}

#[tokio::test]
async fn unknown_breakdown_is_not_found() {
    let ledger = spawn_ledger().await;
    ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();

    let err = ledger
        .service
        .update_balance(BalanceUpdate {
            breakdown_id: Some(Uuid::new_v4()),
            current_balance: Some(dec("10")),
            ..update()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn negative_granted_without_overage_is_rejected() {
    let ledger = spawn_ledger().await;
    let b = ledger
        .service
        .create_grant(grant("pro", ResetInterval::Month, 100))
        .await
        .unwrap();

    let err = ledger
        .service
        .update_balance(BalanceUpdate {
            breakdown_id: Some(b.id),
            granted_balance: Some(dec("-5")),
            ..update()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let view = &check(&ledger).await.breakdowns[0];
    assert_eq!(view.granted_balance, dec("100"));
}
