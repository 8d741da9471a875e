use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// True when `ENVIRONMENT=prod`; defaults are refused in production.
pub fn is_production() -> bool {
    env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod"
}

/// Read an environment variable, falling back to `default` outside production.
pub fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Parse an optional numeric/boolean variable. Absent means `default`;
/// present but unparsable is a configuration error.
pub fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_defaults_when_absent() {
        let value: u32 = parse_env("SERVICE_CORE_TEST_ABSENT_VALUE", 7).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        unsafe { env::set_var("SERVICE_CORE_TEST_BAD_VALUE", "seven") };
        let result: Result<u32, _> = parse_env("SERVICE_CORE_TEST_BAD_VALUE", 7);
        assert!(matches!(result, Err(AppError::ConfigError(_))));

        unsafe { env::set_var("SERVICE_CORE_TEST_GOOD_VALUE", " 12 ") };
        let value: u32 = parse_env("SERVICE_CORE_TEST_GOOD_VALUE", 7).unwrap();
        assert_eq!(value, 12);
    }

    #[test]
    fn test_get_env_required_in_production() {
        let result = get_env("SERVICE_CORE_TEST_MISSING_URL", Some("fallback"), true);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
        let value = get_env("SERVICE_CORE_TEST_MISSING_URL", Some("fallback"), false).unwrap();
        assert_eq!(value, "fallback");
    }
}
