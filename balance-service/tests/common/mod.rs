//! Common test utilities for balance-service integration tests.
//!
//! The ledger runs against the in-memory store and cache, so these tests
//! need no external services.

#![allow(dead_code)]

use balance_service::config::SyncConfig;
use balance_service::models::{
    CreateGrant, CustomerProduct, Entity, Feature, FeatureLedger, GrantScope, LedgerKey,
    ProductStatus, ResetInterval, RolloverConfig, RolloverDuration,
};
use balance_service::services::{
    InMemoryCache, InMemoryStore, LedgerRepository, LedgerService, SyncWriter,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

pub const CUSTOMER: &str = "cus_test";
pub const FEATURE: &str = "api_calls";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,balance_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Writer settings short enough for failure tests to finish quickly.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        worker_count: 2,
        queue_size: 64,
        max_elapsed_ms: 150,
        initial_interval_ms: 5,
        settle_window_ms: 5_000,
    }
}

pub struct TestLedger {
    pub service: LedgerService,
    pub store: Arc<InMemoryStore>,
    pub cache: Arc<InMemoryCache>,
    pub writer: Arc<SyncWriter>,
}

impl TestLedger {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(CUSTOMER, FEATURE)
    }

    /// Wait for every queued store write, failing the test if they do not settle.
    pub async fn settle(&self) {
        assert!(self.writer.settle().await, "store writes did not settle");
    }

    pub async fn stored(&self) -> FeatureLedger {
        use balance_service::services::LedgerStore;
        self.store.load_ledger(&self.key()).await.unwrap().unwrap()
    }
}

/// Spawn a ledger with the test customer and feature seeded in the store.
pub async fn spawn_ledger() -> TestLedger {
    spawn_ledger_with_entities(Vec::new()).await
}

pub async fn spawn_ledger_with_entities(entities: Vec<Entity>) -> TestLedger {
    init_tracing();

    let store = Arc::new(InMemoryStore::new());
    let cache = Arc::new(InMemoryCache::new());
    store
        .seed(FeatureLedger {
            customer_id: CUSTOMER.to_string(),
            feature: Feature {
                feature_id: FEATURE.to_string(),
                name: "API calls".to_string(),
            },
            entities,
            products: Vec::new(),
            breakdowns: Vec::new(),
            version: 0,
        })
        .unwrap();

    let service = service_over(store.clone(), cache.clone(), 50);
    let writer = service.repository().writer().clone();
    TestLedger {
        service,
        store,
        cache,
        writer,
    }
}

/// A second ledger service over the same store and cache, as another
/// process would run.
pub fn service_over(
    store: Arc<InMemoryStore>,
    cache: Arc<InMemoryCache>,
    cas_max_retries: u32,
) -> LedgerService {
    let writer = SyncWriter::start(test_sync_config(), store.clone(), cache.clone());
    let repo = LedgerRepository::new(store, cache, writer, cas_max_retries);
    LedgerService::new(Arc::new(repo))
}

/// Grant on a fresh active product. Resetting intervals get a boundary one
/// interval out.
pub fn grant(plan_id: &str, interval: ResetInterval, granted: i64) -> CreateGrant {
    let now = Utc::now();
    CreateGrant {
        customer_id: CUSTOMER.to_string(),
        feature_id: FEATURE.to_string(),
        product: CustomerProduct {
            id: Uuid::new_v4(),
            plan_id: plan_id.to_string(),
            status: ProductStatus::Active,
            entity_id: None,
            expires_at: None,
        },
        scope: GrantScope::Customer,
        entity_feature_id: None,
        granted_balance: Decimal::from(granted),
        overage_allowed: false,
        reset_interval: interval,
        next_reset_at: interval.advance(now),
        rollover_config: None,
    }
}

/// Grant scoped to one entity of the test customer.
pub fn entity_grant(entity_id: &str, entity_feature: &str, granted: i64) -> CreateGrant {
    let mut g = grant("seat", ResetInterval::Month, granted);
    g.product.entity_id = Some(entity_id.to_string());
    g.scope = GrantScope::Entity {
        entity_id: entity_id.to_string(),
    };
    g.entity_feature_id = Some(entity_feature.to_string());
    g
}

pub fn monthly_rollover(max: Option<&str>) -> RolloverConfig {
    RolloverConfig {
        max: max.map(dec),
        length: 1,
        duration: RolloverDuration::Month,
    }
}

/// A boundary that has already passed.
pub fn past_boundary() -> DateTime<Utc> {
    Utc::now() - Duration::minutes(1)
}
