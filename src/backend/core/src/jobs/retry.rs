//! Failure classification and retry decisions.
//!
//! Every failed attempt is reduced to an [`ErrorCategory`]. The
//! [`RetryPolicy`] then decides whether the job is retried after a backoff
//! delay or parked in the dead letter queue.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::sync::SyncError;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Category
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse failure class recorded on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    ServerError,
    Timeout,
    Connection,
    /// The platform refused because a sync for the connection is already running
    Conflict,
    /// The external sync ran and reported failure
    SyncFailed,
    AuthError,
    NotFound,
    ClientError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        Self::RateLimit,
        Self::ServerError,
        Self::Timeout,
        Self::Connection,
        Self::Conflict,
        Self::SyncFailed,
        Self::AuthError,
        Self::NotFound,
        Self::ClientError,
        Self::Unknown,
    ];

    /// Whether another attempt can plausibly succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthError | Self::NotFound | Self::ClientError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Conflict => "conflict",
            Self::SyncFailed => "sync_failed",
            Self::AuthError => "auth_error",
            Self::NotFound => "not_found",
            Self::ClientError => "client_error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| IngestError::invalid_input("error_category", format!("unknown category '{}'", s)))
    }
}

/// Map a sync failure to its category.
pub fn classify(error: &SyncError) -> ErrorCategory {
    match error {
        SyncError::RateLimited { .. } => ErrorCategory::RateLimit,
        SyncError::Server { .. } => ErrorCategory::ServerError,
        SyncError::Timeout(_) => ErrorCategory::Timeout,
        SyncError::Connection(_) => ErrorCategory::Connection,
        SyncError::Conflict(_) => ErrorCategory::Conflict,
        SyncError::SyncFailed { .. } => ErrorCategory::SyncFailed,
        SyncError::Unauthorized(_) => ErrorCategory::AuthError,
        SyncError::NotFound(_) => ErrorCategory::NotFound,
        SyncError::BadRequest { .. } | SyncError::Decode(_) => ErrorCategory::ClientError,
        SyncError::Other(_) => ErrorCategory::Unknown,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Linear increase in delay (initial + increment * attempt)
    Linear {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        multiplier: f64,
    },
    /// Exponential with random jitter of +/- `jitter_factor`
    ExponentialWithJitter {
        #[serde(with = "humantime_serde")]
        initial_delay: Duration,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialWithJitter {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Linear {
                initial_delay,
                increment,
            } => *initial_delay + increment.saturating_mul(attempt),
            Self::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => Duration::from_secs_f64(exponential_secs(*initial_delay, *max_delay, *multiplier, attempt)),
            Self::ExponentialWithJitter {
                initial_delay,
                max_delay,
                multiplier,
                jitter_factor,
            } => {
                let capped = exponential_secs(*initial_delay, *max_delay, *multiplier, attempt);
                let jitter = if *jitter_factor > 0.0 {
                    let range = capped * jitter_factor;
                    rand::rng().random_range(-range..=range)
                } else {
                    0.0
                };
                Duration::from_secs_f64((capped + jitter).max(1.0))
            }
        }
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create an exponential backoff strategy without jitter.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self::Exponential {
            initial_delay,
            max_delay,
            multiplier,
        }
    }
}

fn exponential_secs(initial: Duration, max: Duration, multiplier: f64, attempt: u32) -> f64 {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay = initial.as_secs_f64() * multiplier.powi(exponent);
    if delay.is_finite() {
        delay.min(max.as_secs_f64())
    } else {
        max.as_secs_f64()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What to do with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryAction {
    Retry { delay: Duration, at: DateTime<Utc> },
    DeadLetter { reason: String },
}

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub category: ErrorCategory,
    pub action: RetryAction,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self.action, RetryAction::Retry { .. })
    }
}

/// Configuration for job retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = dead-letter on first failure)
    pub max_retries: u32,
    /// Backoff strategy for calculating delays
    pub backoff: BackoffStrategy,
    /// Minimum delay after a rate-limit failure without a `Retry-After` hint
    #[serde(with = "humantime_serde")]
    pub rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffStrategy::default(),
            rate_limit_floor: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide the fate of an attempt that failed with `error`, given the
    /// number of retries already scheduled for the job.
    pub fn decide(&self, retry_count: u32, error: &SyncError, now: DateTime<Utc>) -> RetryDecision {
        let category = classify(error);

        if !category.is_retryable() {
            return RetryDecision {
                category,
                action: RetryAction::DeadLetter {
                    reason: format!("non-retryable {} failure: {}", category, error),
                },
            };
        }

        if retry_count >= self.max_retries {
            return RetryDecision {
                category,
                action: RetryAction::DeadLetter {
                    reason: format!(
                        "retries exhausted after {} attempts: {}",
                        retry_count + 1,
                        error
                    ),
                },
            };
        }

        let mut delay = self.backoff.delay_for_attempt(retry_count);
        if let SyncError::RateLimited { retry_after } = error {
            delay = delay.max(retry_after.unwrap_or(self.rate_limit_floor));
        }

        let at = now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(24));
        RetryDecision {
            category,
            action: RetryAction::Retry { delay, at },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
