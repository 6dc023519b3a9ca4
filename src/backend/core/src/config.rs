//! Configuration management.
//!
//! Values come from an optional config file overlaid with `INGEST__`
//! environment variables, e.g. `INGEST__DATABASE__URL` or
//! `INGEST__RUNNER__CONCURRENCY=16`. Durations use humantime (`"30s"`, `"6h"`).

use serde::Deserialize;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};
use crate::jobs::runner::RunnerConfig;
use crate::jobs::scheduler::ScheduleConfig;
use crate::sync::{AirbyteConfig, RateLimitConfig};

const ENV_PREFIX: &str = "INGEST";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration (shared rate limiting)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Sync platform API
    #[serde(default)]
    pub airbyte: AirbyteConfig,

    /// Sync platform rate limits
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry and backoff
    #[serde(default)]
    pub retry: RetryConfig,

    /// Job runner
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Recurring connector syncs
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Time to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL; in-memory rate limiting when unset
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random spread applied to each delay (0 disables jitter)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Minimum delay after a rate-limited attempt without `Retry-After`
    #[serde(default = "default_rate_limit_floor", with = "humantime_serde")]
    pub rate_limit_floor: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: default_jitter_factor(),
            rate_limit_floor: default_rate_limit_floor(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let backoff = if self.jitter_factor > 0.0 {
            BackoffStrategy::ExponentialWithJitter {
                initial_delay: self.initial_delay,
                max_delay: self.max_delay,
                multiplier: self.multiplier,
                jitter_factor: self.jitter_factor,
            }
        } else {
            BackoffStrategy::exponential(self.initial_delay, self.max_delay, self.multiplier)
        };

        RetryPolicy {
            max_retries: self.max_retries,
            backoff,
            rate_limit_floor: self.rate_limit_floor,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Service name reported in traces
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OpenTelemetry OTLP endpoint
    pub otlp_endpoint: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Port for the Prometheus exporter; disabled when unset
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: None,
        }
    }
}

// Default value functions
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_max_retries() -> u32 { 5 }
fn default_initial_delay() -> Duration { Duration::from_secs(30) }
fn default_max_delay() -> Duration { Duration::from_secs(30 * 60) }
fn default_multiplier() -> f64 { 2.0 }
fn default_jitter_factor() -> f64 { 0.1 }
fn default_rate_limit_floor() -> Duration { Duration::from_secs(60) }
fn default_service_name() -> String { "ingest-worker".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }

impl Config {
    /// Load configuration from environment and an optional `ingest.*` file
    /// in the working directory.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("ingest").required(false))
            .add_source(Self::environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load from a specific file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    /// Retry policy for the runner.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    pub fn runner_config(&self) -> RunnerConfig {
        self.runner.clone()
    }

    /// Rate limits, using the shared Redis URL unless one is set explicitly.
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let mut rate_limit = self.rate_limit.clone();
        if rate_limit.redis_url.is_none() {
            rate_limit.redis_url = self.redis.url.clone();
        }
        rate_limit
    }

    /// Reject settings the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(IngestError::configuration("database.url must be set"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(IngestError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        if self.airbyte.api_token.trim().is_empty() {
            return Err(IngestError::configuration("airbyte.api_token must be set"));
        }
        if self.runner.concurrency == 0 {
            return Err(IngestError::configuration("runner.concurrency must be at least 1"));
        }
        if self.runner.max_jobs_per_tenant == 0 {
            return Err(IngestError::configuration(
                "runner.max_jobs_per_tenant must be at least 1",
            ));
        }
        if self.runner.stale_after <= self.runner.sync_timeout {
            return Err(IngestError::configuration(
                "runner.stale_after must be longer than runner.sync_timeout",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(IngestError::configuration(
                "retry.initial_delay must not exceed retry.max_delay",
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(IngestError::configuration("retry.multiplier must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(IngestError::configuration(
                "retry.jitter_factor must be between 0 and 1",
            ));
        }
        if let Some(schedule) = self.schedules.iter().find(|s| s.interval.is_zero()) {
            return Err(IngestError::configuration(format!(
                "schedule for {}/{} has a zero interval",
                schedule.tenant_id, schedule.connector_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn parse(toml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
        [database]
        url = "postgres://localhost/ingest"

        [airbyte]
        api_token = "secret"
    "#;

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.runner.concurrency, 8);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.airbyte.base_url, "https://api.airbyte.com/v1");
        assert!(config.schedules.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_sections_and_schedules() {
        let config = parse(
            r#"
            [database]
            url = "postgres://db/ingest"
            acquire_timeout = "2s"

            [redis]
            url = "redis://cache:6379"

            [airbyte]
            api_token = "secret"
            request_timeout = "10s"

            [runner]
            concurrency = 4
            sync_poll_interval = "30s"

            [retry]
            max_retries = 3
            initial_delay = "1m"
            jitter_factor = 0.0

            [[schedules]]
            tenant_id = "org_1"
            connector_id = "shopify"
            external_connection_id = "conn-1"
            interval = "1h"
            "#,
        );

        assert_eq!(config.database.acquire_timeout, Duration::from_secs(2));
        assert_eq!(config.airbyte.request_timeout, Duration::from_secs(10));
        assert_eq!(config.runner.concurrency, 4);
        assert_eq!(config.runner.sync_poll_interval, Duration::from_secs(30));
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].interval, Duration::from_secs(3600));

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(
            policy.backoff,
            BackoffStrategy::exponential(Duration::from_secs(60), Duration::from_secs(1800), 2.0)
        );

        assert_eq!(
            config.rate_limit_config().redis_url.as_deref(),
            Some("redis://cache:6379")
        );
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = parse(MINIMAL);
        config.runner.concurrency = 0;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidConfiguration);

        let mut config = parse(MINIMAL);
        config.airbyte.api_token = " ".into();
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.retry.initial_delay = Duration::from_secs(3600);
        assert!(config.validate().is_err());

        let mut config = parse(MINIMAL);
        config.runner.stale_after = config.runner.sync_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_database_url_fails() {
        let result = config::Config::builder()
            .add_source(config::File::from_str("[airbyte]\napi_token = \"x\"", config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize::<Config>();
        assert!(result.is_err());
    }
}
