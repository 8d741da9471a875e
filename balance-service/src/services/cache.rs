//! Redis-backed balance cache and delta journal.

use crate::config::RedisConfig;
use crate::models::{BalanceDelta, FeatureLedger, LedgerKey};
use crate::services::store::BalanceCache;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};
use service_core::error::AppError;
use tracing::{info, instrument};
use uuid::Uuid;

/// Compare the cached document's version with ARGV[1] ("-1" for absent),
/// then store the new document and journal the delta together.
const CAS_SCRIPT: &str = r#"
local doc = redis.call('GET', KEYS[1])
local current = '-1'
if doc then
    current = tostring(cjson.decode(doc)['version'])
end
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
if ARGV[4] ~= '' then
    redis.call('HSET', KEYS[2], ARGV[4], ARGV[5])
end
return 1
"#;

#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    key_prefix: String,
    ttl_seconds: u64,
    cas: Script,
}

impl RedisCache {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        info!("Connecting to Redis");
        let client = Client::open(config.url.as_str())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::RedisError(e)
        })?;

        info!("Successfully connected to Redis");

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            ttl_seconds: config.ttl_seconds,
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn ledger_key(&self, key: &LedgerKey) -> String {
        format!(
            "{}:ledger:{}:{}",
            self.key_prefix, key.customer_id, key.feature_id
        )
    }

    fn journal_key(&self) -> String {
        format!("{}:journal", self.key_prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead_letters", self.key_prefix)
    }
}

#[async_trait]
impl BalanceCache for RedisCache {
    #[instrument(skip(self), fields(customer_id = %key.customer_id, feature_id = %key.feature_id))]
    async fn get(&self, key: &LedgerKey) -> Result<Option<FeatureLedger>, AppError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.ledger_key(key))
            .query_async(&mut conn)
            .await?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(AppError::from)
    }

    #[instrument(skip(self, ledger, delta), fields(customer_id = %ledger.customer_id, version = ledger.version))]
    async fn compare_and_set(
        &self,
        expected: Option<u64>,
        ledger: &FeatureLedger,
        delta: Option<&BalanceDelta>,
    ) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let doc = serde_json::to_string(ledger)?;
        let (delta_id, delta_json) = match delta {
            Some(d) => (d.delta_id.to_string(), serde_json::to_string(d)?),
            None => (String::new(), String::new()),
        };
        let expected = expected.map_or_else(|| "-1".to_string(), |v| v.to_string());

        let stored: i32 = self
            .cas
            .key(self.ledger_key(&ledger.key()))
            .key(self.journal_key())
            .arg(expected)
            .arg(doc)
            .arg(self.ttl_seconds)
            .arg(delta_id)
            .arg(delta_json)
            .invoke_async(&mut conn)
            .await?;

        Ok(stored == 1)
    }

    async fn evict(&self, key: &LedgerKey) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.ledger_key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn journal(&self) -> Result<Vec<BalanceDelta>, AppError> {
        let mut conn = self.manager.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.journal_key())
            .query_async(&mut conn)
            .await?;

        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(AppError::from))
            .collect()
    }

    async fn journal_ack(&self, delta_id: Uuid) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("HDEL")
            .arg(self.journal_key())
            .arg(delta_id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_dead_letter(&self, delta: &BalanceDelta) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("RPUSH")
            .arg(self.dead_letter_key())
            .arg(serde_json::to_string(delta)?)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn take_dead_letters(&self) -> Result<Vec<BalanceDelta>, AppError> {
        let mut conn = self.manager.clone();
        let key = self.dead_letter_key();
        let (raw,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(AppError::from))
            .collect()
    }

    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Redis health check failed");
                AppError::ServiceUnavailable
            })?;
        Ok(())
    }
}
