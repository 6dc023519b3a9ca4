//! External sync platform integration.
//!
//! - **SyncApi**: trigger, poll and cancel syncs on the ELT platform
//! - **AirbyteClient**: HTTP implementation against the Airbyte public API
//! - **RateLimitedSyncClient**: per-account and per-connection rate limiting

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod airbyte;
pub mod rate_limit;

pub use airbyte::{AirbyteClient, AirbyteConfig};
pub use rate_limit::{
    RateLimitConfig, RateLimitKey, RateLimitResult, RateLimitedSyncClient, RateLimiter,
};

/// Errors returned by the sync platform or while talking to it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error("rate limited by sync platform{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("sync platform server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("sync platform request timed out: {0}")]
    Timeout(String),

    #[error("failed to reach sync platform: {0}")]
    Connection(String),

    #[error("sync already running on the platform: {0}")]
    Conflict(String),

    #[error("sync platform rejected credentials: {0}")]
    Unauthorized(String),

    #[error("not found on sync platform: {0}")]
    NotFound(String),

    #[error("sync platform rejected request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("external sync failed: {message}")]
    SyncFailed { message: String },

    #[error("unexpected sync platform response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Status of a job on the sync platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalJobStatus {
    Pending,
    Running,
    Incomplete,
    Failed,
    Succeeded,
    Cancelled,
}

impl ExternalJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Incomplete | Self::Failed | Self::Succeeded | Self::Cancelled
        )
    }
}

impl fmt::Display for ExternalJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Incomplete => "incomplete",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Handle to a triggered sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobRef {
    pub external_job_id: String,
    pub status: ExternalJobStatus,
}

/// Polled state of a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobStatus {
    pub external_job_id: String,
    pub status: ExternalJobStatus,
    pub rows_synced: Option<u64>,
    pub bytes_synced: Option<u64>,
    /// Failure summary reported by the platform, if any
    pub message: Option<String>,
}

/// Trigger/poll/cancel API of the sync platform.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Start a sync for an external connection.
    async fn trigger_sync(&self, connection_id: &str) -> Result<SyncJobRef, SyncError>;

    /// Fetch the current state of a triggered sync.
    async fn job_status(&self, external_job_id: &str) -> Result<SyncJobStatus, SyncError>;

    /// Ask the platform to cancel a running sync.
    async fn cancel_job(&self, external_job_id: &str) -> Result<(), SyncError>;
}

#[async_trait]
impl<T: SyncApi + ?Sized> SyncApi for Arc<T> {
    async fn trigger_sync(&self, connection_id: &str) -> Result<SyncJobRef, SyncError> {
        (**self).trigger_sync(connection_id).await
    }

    async fn job_status(&self, external_job_id: &str) -> Result<SyncJobStatus, SyncError> {
        (**self).job_status(external_job_id).await
    }

    async fn cancel_job(&self, external_job_id: &str) -> Result<(), SyncError> {
        (**self).cancel_job(external_job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExternalJobStatus::Pending.is_terminal());
        assert!(!ExternalJobStatus::Running.is_terminal());
        assert!(ExternalJobStatus::Incomplete.is_terminal());
        assert!(ExternalJobStatus::Succeeded.is_terminal());
    }

    #[test]
    fn test_rate_limited_display() {
        let err = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(12)),
        };
        assert_eq!(err.to_string(), "rate limited by sync platform (retry after 12s)");
        let err = SyncError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "rate limited by sync platform");
    }
}
