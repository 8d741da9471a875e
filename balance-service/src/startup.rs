//! Application startup and lifecycle management.

use crate::config::BalanceConfig;
use crate::services::{
    get_metrics, init_metrics, BalanceCache, Database, LedgerRepository, LedgerService,
    LedgerStore, RedisCache, SyncWriter,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde_json::json;
use service_core::error::AppError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// State for health check endpoints.
#[derive(Clone)]
struct HealthState {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
}

impl HealthState {
    async fn check(&self) -> Result<(), AppError> {
        self.store.health_check().await?;
        self.cache.health_check().await
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "balance-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store or cache unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "balance-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.check().await {
        Ok(_) => {
            tracing::debug!("Readiness check passed");
            StatusCode::OK
        }
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = get_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    health: HealthState,
    ledger: LedgerService,
    writer: Arc<SyncWriter>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BalanceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BalanceConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BalanceConfig, run_migrations: bool) -> Result<Self, AppError> {
        // Initialize metrics
        init_metrics();

        // Connect to database
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        // Run migrations only if requested
        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let cache = RedisCache::new(&config.redis).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to Redis");
            e
        })?;

        let store: Arc<dyn LedgerStore> = Arc::new(db);
        let cache: Arc<dyn BalanceCache> = Arc::new(cache);

        // Finish writes interrupted by the previous shutdown
        let writer = SyncWriter::start(config.sync.clone(), store.clone(), cache.clone());
        writer.replay_journal().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to replay delta journal");
            e
        })?;

        let repo = Arc::new(LedgerRepository::new(
            store.clone(),
            cache.clone(),
            writer.clone(),
            config.ledger.cas_max_retries,
        ));
        let ledger = LedgerService::new(repo);

        // Bind HTTP listener
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Balance service listener bound");

        Ok(Self {
            port,
            listener,
            health: HealthState { store, cache },
            ledger,
            writer,
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ledger operations for in-process callers such as scheduled jobs.
    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// The store writer, kept by the caller to drain it at shutdown.
    pub fn writer(&self) -> Arc<SyncWriter> {
        self.writer.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let router = Router::new()
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.health);

        tracing::info!(
            service = "balance-service",
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );

        axum::serve(self.listener, router).await.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
