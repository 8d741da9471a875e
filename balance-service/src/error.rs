//! Ledger error taxonomy.

use service_core::error::AppError;
use thiserror::Error;

/// Errors raised by the balance ledger.
///
/// Pure computations (pricing, proration, resolution) only ever produce the
/// domain variants; `Infrastructure` wraps store and cache failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrency conflict: gave up after {attempts} attempts")]
    ConcurrencyConflict { attempts: u32 },

    #[error(transparent)]
    Infrastructure(#[from] AppError),
}

impl LedgerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        Self::InvalidScope(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Label for the `error_type` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidScope(_) => "invalid_scope",
            Self::Validation(_) => "validation_error",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::Infrastructure(e) => e.kind(),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            LedgerError::InvalidScope(msg)
            | LedgerError::Validation(msg)
            | LedgerError::Config(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            e @ LedgerError::ConcurrencyConflict { .. } => {
                AppError::Conflict(anyhow::anyhow!(e.to_string()))
            }
            LedgerError::Infrastructure(e) => e,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Infrastructure(AppError::DatabaseError(anyhow::Error::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_app_error() {
        let app: AppError = LedgerError::not_found("feature 'x'").into();
        assert!(matches!(app, AppError::NotFound(_)));

        let app: AppError = LedgerError::invalid_scope("entity").into();
        assert!(matches!(app, AppError::BadRequest(_)));

        let app: AppError = LedgerError::ConcurrencyConflict { attempts: 3 }.into();
        assert!(matches!(app, AppError::Conflict(_)));
    }
}
