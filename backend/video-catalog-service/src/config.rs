/// Configuration for the video catalog service
///
/// Loaded from environment variables (after `.env`, if present).
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use transactional_outbox::OutboxProcessorConfig;

use crate::consumers::ConsumerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub storage: StorageBackend,
    pub commands: CommandConfig,
    pub outbox: OutboxConfig,
    pub consumer: ConsumerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    pub env: String,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.env.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Where aggregates, the outbox, the projection and the dedup ledger live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    /// Process memory; local runs only
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Upper bound for one command transaction
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub batch_size: i64,
    pub poll_interval_ms: u64,
    pub max_attempts: i32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub workers: usize,
    pub max_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub max_redelivery_delay_ms: u64,
    pub shutdown_grace_ms: u64,
    pub channel_capacity: usize,
    pub dedup_retention_secs: u64,
    pub dedup_lease_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, String> {
        let app = AppConfig {
            env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            host: std::env::var("VIDEO_CATALOG_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env_or("VIDEO_CATALOG_PORT", 8090)?,
        };

        let storage: StorageBackend = parse_env_or("CATALOG_STORAGE", StorageBackend::Postgres)?;
        if app.is_production() && storage == StorageBackend::Memory {
            return Err("CATALOG_STORAGE=memory is not allowed in production".to_string());
        }

        let database = DatabaseConfig {
            url: match std::env::var("DATABASE_URL") {
                Ok(url) => url,
                Err(_) if app.is_production() && storage == StorageBackend::Postgres => {
                    return Err("DATABASE_URL must be set in production".to_string())
                }
                Err(_) => "postgresql://localhost/video_catalog".to_string(),
            },
            max_connections: parse_env_or("DATABASE_MAX_CONNECTIONS", 10)?,
            acquire_timeout_secs: parse_env_or("DATABASE_ACQUIRE_TIMEOUT_SECS", 5)?,
        };

        let commands = CommandConfig {
            timeout_ms: parse_env_or("COMMAND_TIMEOUT_MS", 5_000)?,
        };
        if commands.timeout_ms == 0 {
            return Err("COMMAND_TIMEOUT_MS must be greater than zero".to_string());
        }

        let outbox = OutboxConfig {
            batch_size: parse_env_or("OUTBOX_BATCH_SIZE", 100)?,
            poll_interval_ms: parse_env_or("OUTBOX_POLL_INTERVAL_MS", 1_000)?,
            max_attempts: parse_env_or("OUTBOX_MAX_ATTEMPTS", 10)?,
            base_backoff_ms: parse_env_or("OUTBOX_BASE_BACKOFF_MS", 1_000)?,
            max_backoff_ms: parse_env_or("OUTBOX_MAX_BACKOFF_MS", 300_000)?,
            workers: parse_env_or("OUTBOX_WORKERS", 4)?,
        };
        if outbox.batch_size <= 0 || outbox.max_attempts <= 0 {
            return Err("OUTBOX_BATCH_SIZE and OUTBOX_MAX_ATTEMPTS must be positive".to_string());
        }

        let consumer = ConsumerSettings {
            workers: parse_env_or("CONSUMER_WORKERS", 4)?,
            max_redeliveries: parse_env_or("CONSUMER_MAX_REDELIVERIES", 10)?,
            redelivery_delay_ms: parse_env_or("CONSUMER_REDELIVERY_DELAY_MS", 500)?,
            max_redelivery_delay_ms: parse_env_or("CONSUMER_MAX_REDELIVERY_DELAY_MS", 30_000)?,
            shutdown_grace_ms: parse_env_or("CONSUMER_SHUTDOWN_GRACE_MS", 10_000)?,
            channel_capacity: parse_env_or("CONSUMER_CHANNEL_CAPACITY", 1_024)?,
            dedup_retention_secs: parse_env_or("DEDUP_RETENTION_SECS", 7 * 24 * 3600)?,
            dedup_lease_secs: parse_env_or("DEDUP_LEASE_SECS", 60)?,
            cleanup_interval_secs: parse_env_or("DEDUP_CLEANUP_INTERVAL_SECS", 3_600)?,
        };

        Ok(Config {
            app,
            database,
            storage,
            commands,
            outbox,
            consumer,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.timeout_ms)
    }

    pub fn outbox_processor(&self) -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            batch_size: self.outbox.batch_size,
            poll_interval: Duration::from_millis(self.outbox.poll_interval_ms),
            max_attempts: self.outbox.max_attempts,
            base_backoff: Duration::from_millis(self.outbox.base_backoff_ms),
            max_backoff: Duration::from_millis(self.outbox.max_backoff_ms),
            workers: self.outbox.workers,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            workers: self.consumer.workers,
            max_redeliveries: self.consumer.max_redeliveries,
            redelivery_delay: Duration::from_millis(self.consumer.redelivery_delay_ms),
            max_redelivery_delay: Duration::from_millis(self.consumer.max_redelivery_delay_ms),
            shutdown_grace: Duration::from_millis(self.consumer.shutdown_grace_ms),
            worker_queue: self.consumer.channel_capacity,
        }
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.consumer.dedup_retention_secs)
    }

    pub fn dedup_lease(&self) -> Duration {
        Duration::from_secs(self.consumer.dedup_lease_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.consumer.cleanup_interval_secs.max(1))
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse()
            .map_err(|e| format!("Failed to parse {}='{}': {}", key, val, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "APP_ENV",
        "CATALOG_STORAGE",
        "DATABASE_URL",
        "COMMAND_TIMEOUT_MS",
        "OUTBOX_BATCH_SIZE",
        "CONSUMER_WORKERS",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();

        assert_eq!(config.storage, StorageBackend::Postgres);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.outbox_processor().max_attempts, 10);
        assert_eq!(config.consumer_config().workers, 4);
    }

    #[test]
    #[serial]
    fn test_memory_storage_rejected_in_production() {
        clear_env();
        std::env::set_var("APP_ENV", "production");
        std::env::set_var("CATALOG_STORAGE", "memory");

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("not allowed in production"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_production_requires_database_url() {
        clear_env();
        std::env::set_var("APP_ENV", "production");

        assert!(Config::from_env().is_err());

        std::env::set_var("DATABASE_URL", "postgresql://db/catalog");
        assert!(Config::from_env().is_ok());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_value_is_an_error() {
        clear_env();
        std::env::set_var("CONSUMER_WORKERS", "many");

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("CONSUMER_WORKERS"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_timeout_rejected() {
        clear_env();
        std::env::set_var("COMMAND_TIMEOUT_MS", "0");

        assert!(Config::from_env().is_err());
        clear_env();
    }
}
