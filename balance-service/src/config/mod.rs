//! Configuration module for balance-service.

use service_core::config::{self as core_config, get_env, is_production, parse_env};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BalanceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub sync: SyncConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    /// Lifetime of a cached ledger document. The delta journal does not expire.
    pub ttl_seconds: u64,
}

/// Background store writer settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub max_elapsed_ms: u64,
    pub initial_interval_ms: u64,
    pub settle_window_ms: u64,
}

impl SyncConfig {
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 1024,
            max_elapsed_ms: 30_000,
            initial_interval_ms: 50,
            settle_window_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Compare-and-set attempts before a mutation fails with a conflict.
    pub cas_max_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { cas_max_retries: 5 }
    }
}

impl BalanceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = is_production();

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            worker_count: parse_env("SYNC_WORKER_COUNT", sync_defaults.worker_count)?,
            queue_size: parse_env("SYNC_QUEUE_SIZE", sync_defaults.queue_size)?,
            max_elapsed_ms: parse_env("SYNC_MAX_ELAPSED_MS", sync_defaults.max_elapsed_ms)?,
            initial_interval_ms: parse_env(
                "SYNC_INITIAL_INTERVAL_MS",
                sync_defaults.initial_interval_ms,
            )?,
            settle_window_ms: parse_env("SYNC_SETTLE_WINDOW_MS", sync_defaults.settle_window_ms)?,
        };
        if sync.worker_count == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SYNC_WORKER_COUNT must be at least 1"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "balance-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
                key_prefix: env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "balance".to_string()),
                ttl_seconds: parse_env("REDIS_TTL_SECONDS", 86_400)?,
            },
            sync,
            ledger: LedgerConfig {
                cas_max_retries: parse_env(
                    "LEDGER_CAS_MAX_RETRIES",
                    LedgerConfig::default().cas_max_retries,
                )?,
            },
        })
    }
}
