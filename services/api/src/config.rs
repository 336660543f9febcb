//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use chrono::{Duration, FixedOffset};
use std::net::SocketAddr;
use std::str::FromStr;
use story_engine_core::settings::{EngineSettings, DEFAULT_PREMIUM_PRODUCT_IDS};
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Which `RecordStore` implementation backs the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => Err(format!("'{other}' is not one of postgres, memory")),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub store_backend: StoreBackend,
    /// Required when `store_backend` is `Postgres`.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub log_level: Level,
    pub view_dedup_window: Duration,
    pub activity_offset: FixedOffset,
    pub premium_product_ids: Vec<String>,
    /// Shared secret for the scheduled popular-search refresh. Unset disables it.
    pub cron_secret: Option<String>,
    /// Period of the in-process popular-search refresh.
    pub popular_refresh_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server ---
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000")?;
        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Storage ---
        let store_backend: StoreBackend = parse_or(&lookup, "STORE_BACKEND", "postgres")?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingVar("DATABASE_URL".to_string()));
        }
        let database_max_connections = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", "5")?;

        // --- Engine ---
        let window_minutes: i64 = parse_or(&lookup, "VIEW_DEDUP_WINDOW_MINUTES", "60")?;
        if window_minutes <= 0 {
            return Err(invalid("VIEW_DEDUP_WINDOW_MINUTES", "must be positive"));
        }
        let offset_minutes: i32 = parse_or(&lookup, "ACTIVITY_UTC_OFFSET_MINUTES", "0")?;
        let activity_offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
            invalid("ACTIVITY_UTC_OFFSET_MINUTES", "offset out of range")
        })?;

        let premium_product_ids = match lookup("PREMIUM_PRODUCT_IDS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_PREMIUM_PRODUCT_IDS.iter().map(|s| s.to_string()).collect(),
        };

        let cron_secret = lookup("CRON_SECRET").filter(|s| !s.trim().is_empty());
        let refresh_hours: i64 = parse_or(&lookup, "POPULAR_REFRESH_INTERVAL_HOURS", "24")?;
        if refresh_hours <= 0 {
            return Err(invalid("POPULAR_REFRESH_INTERVAL_HOURS", "must be positive"));
        }

        Ok(Self {
            bind_address,
            store_backend,
            database_url,
            database_max_connections,
            log_level,
            view_dedup_window: Duration::minutes(window_minutes),
            activity_offset,
            premium_product_ids,
            cron_secret,
            popular_refresh_interval: Duration::hours(refresh_hours),
        })
    }

    /// The engine knobs derived from this configuration.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            view_dedup_window: self.view_dedup_window,
            activity_offset: self.activity_offset,
            premium_product_ids: self.premium_product_ids.clone(),
            ..EngineSettings::default()
        }
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue(key.to_string(), reason.to_string())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}
