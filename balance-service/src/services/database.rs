//! PostgreSQL ledger store for balance-service.

use crate::models::{
    BalanceDelta, Breakdown, CreateGrant, CustomerProduct, DeltaOp, Entity, Feature,
    FeatureLedger, GrantScope, LedgerKey, ProductStatus, ResetInterval, Rollover, RolloverConfig,
    RolloverDuration,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::LedgerStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    customer_product_id: Uuid,
    plan_id: String,
    status: String,
    entity_id: Option<String>,
    expires_utc: Option<DateTime<Utc>>,
}

impl From<ProductRow> for CustomerProduct {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.customer_product_id,
            plan_id: row.plan_id,
            status: ProductStatus::from_string(&row.status),
            entity_id: row.entity_id,
            expires_at: row.expires_utc,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BreakdownRow {
    breakdown_id: Uuid,
    customer_product_id: Uuid,
    feature_id: String,
    entity_id: Option<String>,
    entity_feature_id: Option<String>,
    granted_balance: Decimal,
    current_balance: Decimal,
    purchased_balance: Decimal,
    usage: Decimal,
    overage_allowed: bool,
    reset_interval: String,
    next_reset_utc: Option<DateTime<Utc>>,
    plan_id: String,
    rollover_max: Option<Decimal>,
    rollover_length: Option<i32>,
    rollover_duration: Option<String>,
    created_utc: DateTime<Utc>,
}

impl BreakdownRow {
    fn into_breakdown(self, rollovers: Vec<Rollover>) -> Result<Breakdown, AppError> {
        let reset_interval = ResetInterval::from_string(&self.reset_interval).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "breakdown {} has unknown reset interval '{}'",
                self.breakdown_id,
                self.reset_interval
            ))
        })?;

        let rollover_config = match (self.rollover_length, self.rollover_duration.as_deref()) {
            (Some(length), Some(duration)) => Some(RolloverConfig {
                max: self.rollover_max,
                length: u32::try_from(length).unwrap_or_default(),
                duration: if duration == "forever" {
                    RolloverDuration::Forever
                } else {
                    RolloverDuration::Month
                },
            }),
            _ => None,
        };

        Ok(Breakdown {
            id: self.breakdown_id,
            customer_product_id: self.customer_product_id,
            feature_id: self.feature_id,
            scope: match self.entity_id {
                Some(entity_id) => GrantScope::Entity { entity_id },
                None => GrantScope::Customer,
            },
            entity_feature_id: self.entity_feature_id,
            granted_balance: self.granted_balance,
            current_balance: self.current_balance,
            purchased_balance: self.purchased_balance,
            usage: self.usage,
            overage_allowed: self.overage_allowed,
            reset_interval,
            next_reset_at: self.next_reset_utc,
            plan_id: self.plan_id,
            rollover_config,
            rollovers,
            created_at: self.created_utc,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RolloverRow {
    rollover_id: Uuid,
    breakdown_id: Uuid,
    balance: Decimal,
    usage: Decimal,
    expires_utc: Option<DateTime<Utc>>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "balance-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn apply_op(
        tx: &mut Transaction<'_, Postgres>,
        op: &DeltaOp,
    ) -> Result<u64, AppError> {
        let result = match op {
            DeltaOp::AdjustBreakdown {
                breakdown_id,
                granted,
                current,
                purchased,
                usage,
            } => {
                sqlx::query(
                    r#"
                    UPDATE breakdowns
                    SET granted_balance = granted_balance + $2,
                        current_balance = current_balance + $3,
                        purchased_balance = purchased_balance + $4,
                        usage = usage + $5
                    WHERE breakdown_id = $1
                    "#,
                )
                .bind(breakdown_id)
                .bind(granted)
                .bind(current)
                .bind(purchased)
                .bind(usage)
                .execute(&mut **tx)
                .await
            }
            DeltaOp::SetNextReset {
                breakdown_id,
                next_reset_at,
            } => {
                sqlx::query("UPDATE breakdowns SET next_reset_utc = $2 WHERE breakdown_id = $1")
                    .bind(breakdown_id)
                    .bind(next_reset_at)
                    .execute(&mut **tx)
                    .await
            }
            DeltaOp::AdjustRollover {
                rollover_id,
                balance,
                usage,
            } => {
                sqlx::query(
                    r#"
                    UPDATE rollovers
                    SET balance = balance + $2, usage = usage + $3
                    WHERE rollover_id = $1
                    "#,
                )
                .bind(rollover_id)
                .bind(balance)
                .bind(usage)
                .execute(&mut **tx)
                .await
            }
            DeltaOp::InsertRollover { rollover } => {
                sqlx::query(
                    r#"
                    INSERT INTO rollovers (rollover_id, breakdown_id, balance, usage, expires_utc)
                    SELECT $1, $2, $3, $4, $5
                    WHERE EXISTS (SELECT 1 FROM breakdowns WHERE breakdown_id = $2)
                    ON CONFLICT (rollover_id) DO NOTHING
                    "#,
                )
                .bind(rollover.id)
                .bind(rollover.breakdown_id)
                .bind(rollover.balance)
                .bind(rollover.usage)
                .bind(rollover.expires_at)
                .execute(&mut **tx)
                .await
            }
            DeltaOp::DeleteRollover { rollover_id } => {
                // Already gone counts as applied.
                return sqlx::query("DELETE FROM rollovers WHERE rollover_id = $1")
                    .bind(rollover_id)
                    .execute(&mut **tx)
                    .await
                    .map(|_| 1)
                    .map_err(|e| db_error("Failed to delete rollover", e));
            }
        };

        result
            .map(|r| r.rows_affected())
            .map_err(|e| db_error("Failed to apply delta op", e))
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(customer_id = %key.customer_id, feature_id = %key.feature_id))]
    async fn load_ledger(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_ledger"])
            .start_timer();

        let feature = sqlx::query_as::<_, (String, String)>(
            "SELECT feature_id, name FROM features WHERE feature_id = $1",
        )
        .bind(&key.feature_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get feature", e))?;
        let Some((feature_id, name)) = feature else {
            return Ok(None);
        };

        let customer_exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM customers WHERE customer_id = $1)")
                .bind(&key.customer_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("Failed to get customer", e))?;
        if !customer_exists {
            return Ok(None);
        }

        let entities = sqlx::query_as::<_, (String, String)>(
            "SELECT entity_id, feature_id FROM entities WHERE customer_id = $1 ORDER BY entity_id",
        )
        .bind(&key.customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list entities", e))?
        .into_iter()
        .map(|(entity_id, feature_id)| Entity {
            entity_id,
            feature_id,
        })
        .collect();

        let products = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT customer_product_id, plan_id, status, entity_id, expires_utc
            FROM customer_products
            WHERE customer_id = $1
            "#,
        )
        .bind(&key.customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list customer products", e))?
        .into_iter()
        .map(CustomerProduct::from)
        .collect();

        let rows = sqlx::query_as::<_, BreakdownRow>(
            r#"
            SELECT b.breakdown_id, b.customer_product_id, b.feature_id, b.entity_id,
                   b.entity_feature_id, b.granted_balance, b.current_balance,
                   b.purchased_balance, b.usage, b.overage_allowed, b.reset_interval,
                   b.next_reset_utc, p.plan_id, b.rollover_max, b.rollover_length,
                   b.rollover_duration, b.created_utc
            FROM breakdowns b
            JOIN customer_products p ON p.customer_product_id = b.customer_product_id
            WHERE b.customer_id = $1 AND b.feature_id = $2
            ORDER BY b.created_utc, b.breakdown_id
            "#,
        )
        .bind(&key.customer_id)
        .bind(&key.feature_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list breakdowns", e))?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.breakdown_id).collect();
        let mut rollovers: HashMap<Uuid, Vec<Rollover>> = HashMap::new();
        for r in sqlx::query_as::<_, RolloverRow>(
            r#"
            SELECT rollover_id, breakdown_id, balance, usage, expires_utc
            FROM rollovers
            WHERE breakdown_id = ANY($1)
            ORDER BY rollover_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list rollovers", e))?
        {
            rollovers.entry(r.breakdown_id).or_default().push(Rollover {
                id: r.rollover_id,
                breakdown_id: r.breakdown_id,
                balance: r.balance,
                usage: r.usage,
                expires_at: r.expires_utc,
            });
        }

        let breakdowns = rows
            .into_iter()
            .map(|row| {
                let attached = rollovers.remove(&row.breakdown_id).unwrap_or_default();
                row.into_breakdown(attached)
            })
            .collect::<Result<Vec<_>, _>>()?;

        timer.observe_duration();

        Ok(Some(FeatureLedger {
            customer_id: key.customer_id.clone(),
            feature: Feature { feature_id, name },
            entities,
            products,
            breakdowns,
            version: 0,
        }))
    }

    #[instrument(skip(self, delta), fields(delta_id = %delta.delta_id, key = %delta.key, seq = delta.seq))]
    async fn apply_delta(&self, delta: &BalanceDelta) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_delta"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        let recorded = sqlx::query(
            r#"
            INSERT INTO applied_deltas (delta_id, customer_id, feature_id, seq)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (delta_id) DO NOTHING
            "#,
        )
        .bind(delta.delta_id)
        .bind(&delta.key.customer_id)
        .bind(&delta.key.feature_id)
        .bind(i64::try_from(delta.seq).unwrap_or(i64::MAX))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to record delta", e))?
        .rows_affected();

        if recorded == 0 {
            tx.rollback()
                .await
                .map_err(|e| db_error("Failed to roll back", e))?;
            info!("Delta already applied, skipping");
            return Ok(false);
        }

        let mut skipped = 0;
        for op in &delta.ops {
            if Self::apply_op(&mut tx, op).await? == 0 {
                skipped += 1;
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();

        if skipped > 0 {
            warn!(skipped = skipped, "Delta referenced missing breakdowns or rollovers");
        }
        info!(ops = delta.ops.len(), "Delta applied");

        Ok(true)
    }

    async fn applied_deltas(&self, delta_ids: &[Uuid]) -> Result<HashSet<Uuid>, AppError> {
        if delta_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT delta_id FROM applied_deltas WHERE delta_id = ANY($1)
            "#,
        )
        .bind(delta_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to look up applied deltas", e))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    #[instrument(skip(self, grant, breakdown), fields(customer_id = %grant.customer_id, feature_id = %grant.feature_id, breakdown_id = %breakdown.id))]
    async fn insert_grant(
        &self,
        grant: &CreateGrant,
        breakdown: &Breakdown,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_grant"])
            .start_timer();

        let not_found = |e: sqlx::Error| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                AppError::NotFound(anyhow::anyhow!(
                    "Customer '{}' or feature '{}' does not exist",
                    grant.customer_id,
                    grant.feature_id
                ))
            }
            _ => db_error("Failed to insert grant", e),
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO customer_products (customer_product_id, customer_id, plan_id, status, entity_id, expires_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (customer_product_id) DO UPDATE
            SET plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                expires_utc = EXCLUDED.expires_utc
            "#,
        )
        .bind(grant.product.id)
        .bind(&grant.customer_id)
        .bind(&grant.product.plan_id)
        .bind(grant.product.status.as_str())
        .bind(&grant.product.entity_id)
        .bind(grant.product.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(not_found)?;

        let (max, length, duration) = match &breakdown.rollover_config {
            Some(cfg) => (
                cfg.max,
                Some(i32::try_from(cfg.length).unwrap_or(i32::MAX)),
                Some(match cfg.duration {
                    RolloverDuration::Month => "month",
                    RolloverDuration::Forever => "forever",
                }),
            ),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO breakdowns (
                breakdown_id, customer_product_id, customer_id, feature_id, entity_id,
                entity_feature_id, granted_balance, current_balance, purchased_balance, usage,
                overage_allowed, reset_interval, next_reset_utc, rollover_max, rollover_length,
                rollover_duration, created_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(breakdown.id)
        .bind(breakdown.customer_product_id)
        .bind(&grant.customer_id)
        .bind(&breakdown.feature_id)
        .bind(breakdown.entity_id())
        .bind(&breakdown.entity_feature_id)
        .bind(breakdown.granted_balance)
        .bind(breakdown.current_balance)
        .bind(breakdown.purchased_balance)
        .bind(breakdown.usage)
        .bind(breakdown.overage_allowed)
        .bind(breakdown.reset_interval.as_str())
        .bind(breakdown.next_reset_at)
        .bind(max)
        .bind(length)
        .bind(duration)
        .bind(breakdown.created_at)
        .execute(&mut *tx)
        .await
        .map_err(not_found)?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        timer.observe_duration();

        info!(
            granted_balance = %breakdown.granted_balance,
            reset_interval = %breakdown.reset_interval,
            "Grant created"
        );

        Ok(())
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}
