//! Rate limiting for calls to the sync platform.
//!
//! Features:
//! - Token bucket per key for smooth limiting with bursts
//! - Two scopes: the whole platform account, and each external connection
//! - Redis-backed fixed window for limiting across worker replicas
//! - Graceful degradation to in-memory buckets when Redis is unavailable
//! - Cool-down of a key after the platform answers 429
//!
//! # Example
//!
//! ```rust,ignore
//! let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()).await?);
//! let client = RateLimitedSyncClient::new(AirbyteClient::new(&cfg)?, limiter);
//! let job = client.trigger_sync("conn-123").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{SyncApi, SyncError, SyncJobRef, SyncJobStatus};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,

    /// Sustained requests per minute for the whole account
    pub account_requests_per_minute: u64,

    /// Burst capacity for the account bucket
    pub account_burst: u64,

    /// Sustained requests per minute for a single connection
    pub connection_requests_per_minute: u64,

    /// Burst capacity for each connection bucket
    pub connection_burst: u64,

    /// Longest a caller waits for a token before giving up with `RateLimited`
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    /// Redis URL for distributed limiting (in-memory only when unset)
    pub redis_url: Option<String>,

    /// Key prefix for Redis keys
    pub redis_key_prefix: String,

    /// Fall back to in-memory limiting when Redis fails
    pub graceful_degradation: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            account_requests_per_minute: 120,
            account_burst: 20,
            connection_requests_per_minute: 6,
            connection_burst: 2,
            max_wait: Duration::from_secs(30),
            redis_url: None,
            redis_key_prefix: "ingest:ratelimit:".to_string(),
            graceful_degradation: true,
        }
    }
}

impl RateLimitConfig {
    /// Create a new builder for rate limit configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    fn limits_for(&self, key: &RateLimitKey) -> (u64, u64) {
        match key {
            RateLimitKey::Account => (self.account_burst, self.account_requests_per_minute),
            RateLimitKey::Connection(_) => {
                (self.connection_burst, self.connection_requests_per_minute)
            }
        }
    }
}

/// Builder for rate limit configuration.
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn account(mut self, requests_per_minute: u64, burst: u64) -> Self {
        self.config.account_requests_per_minute = requests_per_minute;
        self.config.account_burst = burst;
        self
    }

    pub fn connection(mut self, requests_per_minute: u64, burst: u64) -> Self {
        self.config.connection_requests_per_minute = requests_per_minute;
        self.config.connection_burst = burst;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.config.max_wait = max_wait;
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.config.redis_url = Some(url.into());
        self
    }

    pub fn graceful_degradation(mut self, enabled: bool) -> Self {
        self.config.graceful_degradation = enabled;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Token Bucket
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
    /// No tokens are handed out before this instant (set after an upstream 429)
    blocked_until: Option<Instant>,
}

impl TokenBucket {
    fn new(capacity: u64, per_minute: u64) -> Self {
        Self {
            tokens: capacity.max(1) as f64,
            capacity: capacity.max(1) as f64,
            refill_rate: per_minute.max(1) as f64 / 60.0,
            last_refill: Instant::now(),
            blocked_until: None,
        }
    }

    /// Take one token, or return how long until one is available.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(until) = self.blocked_until {
            if now < until {
                return Err(until - now);
            }
            self.blocked_until = None;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate))
        }
    }

    fn available(&mut self, now: Instant) -> u64 {
        self.refill(now);
        self.tokens as u64
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn block_for(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        self.blocked_until = Some(self.blocked_until.map_or(until, |current| current.max(until)));
        self.tokens = 0.0;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Scope a token is drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    /// Every request made with the platform credentials
    Account,
    /// Requests concerning one external connection
    Connection(String),
}

impl RateLimitKey {
    fn to_key(&self, prefix: &str) -> String {
        match self {
            Self::Account => format!("{}account", prefix),
            Self::Connection(id) => format!("{}connection:{}", prefix, id),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Connection(_) => "connection",
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key(""))
    }
}

/// Rate limit check result.
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Current limit (bucket capacity or window limit)
    pub limit: u64,

    /// Remaining requests
    pub remaining: u64,

    /// Wait before retrying (if rate limited)
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u64::MAX,
            remaining: u64::MAX,
            retry_after: None,
        }
    }
}

/// Rate limiter with an optional Redis backend for distributed limiting.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<RateLimitKey, RwLock<TokenBucket>>,
    redis_client: Option<redis::Client>,
    redis_healthy: Arc<RwLock<bool>>,
    health_check_semaphore: Arc<Semaphore>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("keys", &self.buckets.len())
            .field("redis", &self.redis_client.is_some())
            .finish()
    }
}

impl RateLimiter {
    /// Create a new rate limiter, connecting to Redis when configured.
    pub async fn new(config: RateLimitConfig) -> Result<Self, SyncError> {
        let redis_client = if let Some(ref url) = config.redis_url {
            match redis::Client::open(url.as_str()) {
                Ok(client) => match client.get_multiplexed_async_connection().await {
                    Ok(_) => {
                        info!("Rate limiter connected to Redis at {}", url);
                        Some(client)
                    }
                    Err(e) if config.graceful_degradation => {
                        warn!("Failed to connect to Redis for rate limiting: {}. Using in-memory fallback.", e);
                        None
                    }
                    Err(e) => {
                        return Err(SyncError::Other(format!("rate limiter Redis unavailable: {}", e)))
                    }
                },
                Err(e) => {
                    warn!("Failed to create Redis client: {}. Using in-memory fallback.", e);
                    None
                }
            }
        } else {
            debug!("No Redis URL configured, using in-memory rate limiting");
            None
        };

        Ok(Self::build(config, redis_client))
    }

    /// In-memory limiter (no Redis).
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: RateLimitConfig, redis_client: Option<redis::Client>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            redis_client,
            redis_healthy: Arc::new(RwLock::new(true)),
            health_check_semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to take one token for `key` without waiting.
    pub async fn check(&self, key: &RateLimitKey) -> Result<RateLimitResult, SyncError> {
        if !self.config.enabled {
            return Ok(RateLimitResult::unlimited());
        }

        // A local cool-down after an upstream 429 wins over the shared window.
        if let Some(wait) = self.local_block(key) {
            return Ok(self.denied(key, wait));
        }

        if self.redis_client.is_some() && *self.redis_healthy.read() {
            match self.check_redis(key).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!("Redis rate limit check failed: {}. Falling back to in-memory.", e);
                    self.mark_redis_unhealthy();
                    if !self.config.graceful_degradation {
                        return Err(SyncError::Other(format!("rate limiter Redis error: {}", e)));
                    }
                }
            }
        }

        Ok(self.check_in_memory(key))
    }

    /// Wait for a token for `key`, at most `max_wait`.
    pub async fn acquire(&self, key: &RateLimitKey) -> Result<(), SyncError> {
        let started = Instant::now();
        loop {
            let result = self.check(key).await?;
            if result.allowed {
                return Ok(());
            }

            let wait = result.retry_after.unwrap_or(Duration::from_secs(1));
            let waited = started.elapsed();
            if waited + wait > self.config.max_wait {
                counter!("ingest_rate_limit_rejections_total", "scope" => key.kind()).increment(1);
                return Err(SyncError::RateLimited {
                    retry_after: Some(wait),
                });
            }

            counter!("ingest_rate_limit_waits_total", "scope" => key.kind()).increment(1);
            debug!(key = %key, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Block `key` for `duration`, e.g. after the platform returned 429.
    pub fn penalize(&self, key: &RateLimitKey, duration: Duration) {
        let (capacity, per_minute) = self.config.limits_for(key);
        let entry = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| RwLock::new(TokenBucket::new(capacity, per_minute)));
        entry.write().block_for(Instant::now(), duration);
        warn!(key = %key, secs = duration.as_secs(), "Rate limit cool-down applied");
    }

    fn local_block(&self, key: &RateLimitKey) -> Option<Duration> {
        let entry = self.buckets.get(key)?;
        let bucket = entry.read();
        let until = bucket.blocked_until?;
        let now = Instant::now();
        (now < until).then(|| until - now)
    }

    fn denied(&self, key: &RateLimitKey, wait: Duration) -> RateLimitResult {
        RateLimitResult {
            allowed: false,
            limit: self.config.limits_for(key).0,
            remaining: 0,
            retry_after: Some(wait),
        }
    }

    /// Fixed one-minute window shared by all replicas.
    async fn check_redis(&self, key: &RateLimitKey) -> Result<RateLimitResult, redis::RedisError> {
        let Some(client) = self.redis_client.as_ref() else {
            return Ok(self.check_in_memory(key));
        };
        let mut conn = client.get_multiplexed_async_connection().await?;

        let (_, limit) = self.config.limits_for(key);
        let window_secs: i64 = 60;
        let now: DateTime<Utc> = Utc::now();
        let window_start = now.timestamp() / window_secs * window_secs;
        let window_key = format!("{}:{}", key.to_key(&self.config.redis_key_prefix), window_start);

        let script = redis::Script::new(
            r#"
            local current = redis.call('INCR', KEYS[1])
            if current == 1 then
                redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]) + 1)
            end
            return current
            "#,
        );

        let count: u64 = script
            .key(&window_key)
            .arg(window_secs)
            .invoke_async(&mut conn)
            .await?;

        let allowed = count <= limit;
        let retry_after = (!allowed).then(|| {
            let reset = window_start + window_secs - now.timestamp();
            Duration::from_secs(reset.max(1) as u64)
        });

        counter!(
            "ingest_rate_limit_checks_total",
            "scope" => key.kind(),
            "allowed" => allowed.to_string(),
            "backend" => "redis"
        )
        .increment(1);

        Ok(RateLimitResult {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            retry_after,
        })
    }

    fn check_in_memory(&self, key: &RateLimitKey) -> RateLimitResult {
        let (capacity, per_minute) = self.config.limits_for(key);
        let entry = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| RwLock::new(TokenBucket::new(capacity, per_minute)));

        let now = Instant::now();
        let mut bucket = entry.write();
        let outcome = bucket.try_acquire(now);
        let remaining = bucket.available(now);
        let allowed = outcome.is_ok();

        counter!(
            "ingest_rate_limit_checks_total",
            "scope" => key.kind(),
            "allowed" => allowed.to_string(),
            "backend" => "in_memory"
        )
        .increment(1);

        RateLimitResult {
            allowed,
            limit: capacity,
            remaining,
            retry_after: outcome.err(),
        }
    }

    /// Mark Redis as unhealthy and schedule a health check.
    fn mark_redis_unhealthy(&self) {
        *self.redis_healthy.write() = false;

        let client = self.redis_client.clone();
        let healthy = self.redis_healthy.clone();
        let semaphore = self.health_check_semaphore.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.try_acquire() else {
                return;
            };
            tokio::time::sleep(Duration::from_secs(5)).await;

            if let Some(ref client) = client {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                    let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                    if ping.is_ok() {
                        info!("Redis connection recovered for rate limiting");
                        *healthy.write() = true;
                    }
                }
            }
        });
    }

    /// Drop buckets idle for longer than `max_idle`.
    pub fn cleanup_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            let bucket = bucket.read();
            let blocked = bucket.blocked_until.map_or(false, |until| until > now);
            blocked || now.saturating_duration_since(bucket.last_refill) < max_idle
        });
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rate-limited client
// ═══════════════════════════════════════════════════════════════════════════════

/// Wraps a [`SyncApi`] so every call draws from the limiter first.
pub struct RateLimitedSyncClient<C> {
    inner: C,
    limiter: Arc<RateLimiter>,
}

impl<C> RateLimitedSyncClient<C> {
    pub fn new(inner: C, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Apply a cool-down to the account key when the platform rate limits us.
    fn observe<T>(&self, result: Result<T, SyncError>) -> Result<T, SyncError> {
        if let Err(SyncError::RateLimited { retry_after }) = &result {
            let cool_down = retry_after.unwrap_or(Duration::from_secs(60));
            self.limiter.penalize(&RateLimitKey::Account, cool_down);
        }
        result
    }
}

#[async_trait]
impl<C: SyncApi> SyncApi for RateLimitedSyncClient<C> {
    async fn trigger_sync(&self, connection_id: &str) -> Result<SyncJobRef, SyncError> {
        self.limiter.acquire(&RateLimitKey::Account).await?;
        self.limiter
            .acquire(&RateLimitKey::Connection(connection_id.to_string()))
            .await?;
        let result = self.inner.trigger_sync(connection_id).await;
        self.observe(result)
    }

    async fn job_status(&self, external_job_id: &str) -> Result<SyncJobStatus, SyncError> {
        self.limiter.acquire(&RateLimitKey::Account).await?;
        let result = self.inner.job_status(external_job_id).await;
        self.observe(result)
    }

    async fn cancel_job(&self, external_job_id: &str) -> Result<(), SyncError> {
        self.limiter.acquire(&RateLimitKey::Account).await?;
        let result = self.inner.cancel_job(external_job_id).await;
        self.observe(result)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
