//! Configuration management for Beacon
//!
//! Loads and validates configuration from environment variables (optionally
//! seeded from a `.env` file). Every tunable named here has a default that
//! works against a local Redis, so `beacon-admin` starts with nothing set
//! but `REDIS_HOST` in most deployments.

use anyhow::Result;
use serde::Deserialize;
use std::env;

/// Main configuration struct for the whole service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub redis: RedisConfig,
    pub streams: StreamsConfig,
    pub consumers: ConsumersConfig,
    pub tasks: TasksConfig,
    pub admin: AdminConfig,
    pub observability: ObservabilityConfig,
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u32,
}

impl RedisConfig {
    /// Build the connection URL, folding in password and db when present
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Stream-level policy: retries, trimming
#[derive(Debug, Clone, Deserialize)]
pub struct StreamsConfig {
    /// Deliveries before an entry is dead-lettered
    pub max_retries: u64,

    /// Base delay before a failed entry becomes eligible for redelivery
    pub retry_delay_ms: u64,

    /// Approximate MAXLEN cap applied on every append
    pub max_length: usize,
}

/// Consumer loop timings
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumersConfig {
    /// Prefix namespacing every consumer group (isolates deployments
    /// sharing one backend)
    pub group_prefix: String,

    /// XREADGROUP BLOCK time
    pub block_time_ms: u64,

    /// Idle threshold after which another consumer may claim a pending
    /// entry; also the cadence of the pending sweep
    pub claim_idle_time_ms: u64,

    /// Entries per XREADGROUP
    pub batch_size: usize,
}

/// Task queue tuning
#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    /// Bound on simultaneously running task handlers
    pub max_concurrent: usize,

    /// Backpressure bound on the ready set; enqueues beyond it are refused
    pub max_queued: usize,

    /// Default retry policy for tasks that do not carry their own
    pub default_max_attempts: u32,
    pub default_base_delay_ms: u64,
    pub default_max_delay_ms: u64,

    /// Default per-invocation handler timeout
    pub handler_timeout_ms: u64,

    /// Cadence of the queue health/stats tick
    pub health_check_interval_ms: u64,

    /// How long terminal dead tasks stay visible in stats
    pub dead_letter_retention_ms: u64,

    /// Stream receiving the ready set on graceful shutdown
    pub holding_stream: String,
}

/// Admin HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub rust_log: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            redis: RedisConfig {
                host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
                port: env_parse("REDIS_PORT", 6379),
                password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                db: env_parse("REDIS_DB", 0),
            },
            streams: StreamsConfig {
                max_retries: env_parse("STREAM_MAX_RETRIES", 3),
                retry_delay_ms: env_parse("STREAM_RETRY_DELAY_MS", 1_000),
                max_length: env_parse("STREAM_MAX_LENGTH", 100_000),
            },
            consumers: ConsumersConfig {
                group_prefix: env::var("CONSUMER_GROUP_PREFIX")
                    .unwrap_or_else(|_| "beacon".to_string()),
                block_time_ms: env_parse("CONSUMER_BLOCK_TIME_MS", 5_000),
                claim_idle_time_ms: env_parse("CONSUMER_CLAIM_IDLE_TIME_MS", 30_000),
                batch_size: env_parse("CONSUMER_BATCH_SIZE", 100),
            },
            tasks: TasksConfig {
                max_concurrent: env_parse("TASK_MAX_CONCURRENT", 10),
                max_queued: env_parse("TASK_MAX_QUEUED", 100),
                default_max_attempts: env_parse("TASK_DEFAULT_MAX_ATTEMPTS", 3),
                default_base_delay_ms: env_parse("TASK_DEFAULT_BASE_DELAY_MS", 1_000),
                default_max_delay_ms: env_parse("TASK_DEFAULT_MAX_DELAY_MS", 60_000),
                handler_timeout_ms: env_parse("TASK_HANDLER_TIMEOUT_MS", 30_000),
                health_check_interval_ms: env_parse("TASK_HEALTH_CHECK_INTERVAL_MS", 30_000),
                dead_letter_retention_ms: env_parse("TASK_DEAD_LETTER_RETENTION_MS", 3_600_000),
                holding_stream: env::var("TASK_HOLDING_STREAM")
                    .unwrap_or_else(|_| "beacon.tasks.holding".to_string()),
            },
            admin: AdminConfig {
                host: env::var("ADMIN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("ADMIN_PORT", 8080),
            },
            observability: ObservabilityConfig {
                rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.consumers.group_prefix.is_empty() {
            anyhow::bail!("CONSUMER_GROUP_PREFIX must not be empty");
        }
        if self.tasks.max_concurrent == 0 {
            anyhow::bail!("TASK_MAX_CONCURRENT must be at least 1");
        }
        if self.tasks.max_queued < self.tasks.max_concurrent {
            anyhow::bail!("TASK_MAX_QUEUED must be >= TASK_MAX_CONCURRENT");
        }
        if self.streams.max_retries == 0 {
            anyhow::bail!("STREAM_MAX_RETRIES must be at least 1");
        }
        if self.tasks.default_base_delay_ms > self.tasks.default_max_delay_ms {
            anyhow::bail!("TASK_DEFAULT_BASE_DELAY_MS must be <= TASK_DEFAULT_MAX_DELAY_MS");
        }
        Ok(())
    }

    /// Default consumer name: hostname plus a caller-chosen suffix
    pub fn default_consumer_name(suffix: &str) -> String {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "beacon".to_string());
        format!("{host}-{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_beacon_env() {
        for (key, _) in env::vars() {
            if key.starts_with("REDIS_")
                || key.starts_with("STREAM_")
                || key.starts_with("CONSUMER_")
                || key.starts_with("TASK_")
                || key.starts_with("ADMIN_")
            {
                unsafe { env::remove_var(&key) };
            }
        }
    }

    // Environment mutation is process-global, so the env-touching checks
    // share one test instead of racing each other.
    #[test]
    fn test_load_and_validate() {
        clear_beacon_env();
        let config = Config::from_env().expect("defaults must validate");

        assert_eq!(config.redis.url(), "redis://localhost:6379/0");
        assert_eq!(config.streams.max_retries, 3);
        assert_eq!(config.consumers.group_prefix, "beacon");
        assert_eq!(config.tasks.max_concurrent, 10);
        assert_eq!(config.tasks.holding_stream, "beacon.tasks.holding");

        unsafe { env::set_var("TASK_MAX_CONCURRENT", "0") };
        assert!(Config::from_env().is_err());
        unsafe { env::remove_var("TASK_MAX_CONCURRENT") };
    }

    #[test]
    fn test_redis_url_with_password() {
        let redis = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            password: Some("s3cret".to_string()),
            db: 2,
        };
        assert_eq!(redis.url(), "redis://:s3cret@cache.internal:6380/2");
    }

    #[test]
    fn test_default_consumer_name_has_suffix() {
        let name = Config::default_consumer_name("worker-3");
        assert!(name.ends_with("-worker-3"));
    }
}
