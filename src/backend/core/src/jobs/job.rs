//! Ingestion job records and their state machine.
//!
//! This module provides the core job abstractions:
//!
//! - **Identifiers**: `JobId`, `TenantId`, `ConnectorId`
//! - **JobStatus**: the persisted lifecycle state
//! - **IngestionJob**: the job record with validated transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::jobs::retry::ErrorCategory;

// ═══════════════════════════════════════════════════════════════════════════════
// Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| IngestError::invalid_input("job_id", e.to_string()))
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap an identifier. Surrounding whitespace is trimmed.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                let trimmed = value.as_ref().trim();
                if trimmed.is_empty() {
                    return Err(IngestError::invalid_input($field, "must not be empty"));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IngestError;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = IngestError;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Tenant (store or agency organization) that owns a job.
    TenantId,
    "tenant_id"
);

string_id!(
    /// Internal identifier of a configured data source.
    ConnectorId,
    "connector_id"
);

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a runner to pick it up
    Queued,
    /// Claimed by a runner; the external sync is being triggered or polled
    Running,
    /// Last attempt failed; waiting for `next_retry_at`
    Failed,
    /// Retries exhausted or non-retryable failure; needs an operator
    DeadLetter,
    /// Sync finished successfully
    Success,
    /// Cancelled by an operator or by the sync platform
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Queued,
        Self::Running,
        Self::Failed,
        Self::DeadLetter,
        Self::Success,
        Self::Cancelled,
    ];

    /// Statuses that hold the (tenant, connector) slot.
    pub const ACTIVE: [JobStatus; 3] = [Self::Queued, Self::Running, Self::Failed];

    /// Whether the job occupies its connector's single active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Failed)
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::DeadLetter => "dead_letter",
            Self::Success => "success",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| IngestError::invalid_input("status", format!("unknown status '{}'", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ingestion Job
// ═══════════════════════════════════════════════════════════════════════════════

/// A single ingestion run of one connector for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    /// Connection identifier on the sync platform
    pub external_connection_id: String,
    pub status: JobStatus,
    /// Retries scheduled since the last (re)queue
    pub retry_count: u32,
    /// Times an operator moved the job out of the dead letter queue
    pub requeue_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Sync platform job id for the current attempt
    pub external_job_id: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub records_synced: Option<u64>,
    pub bytes_synced: Option<u64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    /// Create a new queued job.
    pub fn new(
        tenant_id: TenantId,
        connector_id: ConnectorId,
        external_connection_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            connector_id,
            external_connection_id: external_connection_id.into(),
            status: JobStatus::Queued,
            retry_count: 0,
            requeue_count: 0,
            next_retry_at: None,
            external_job_id: None,
            error_message: None,
            error_category: None,
            records_synced: None,
            bytes_synced: None,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach free-form metadata (merged into the metadata object).
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match (&mut self.metadata, metadata) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(extra)) => {
                existing.extend(extra);
            }
            (_, serde_json::Value::Null) => {}
            (slot, other) => *slot = other,
        }
        self
    }

    /// Whether a runner may claim this job at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::Failed => self.next_retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Instant used to order runnable jobs (oldest first).
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.next_retry_at.unwrap_or(self.created_at)
    }

    /// Wall-clock duration of the current or last attempt.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    fn ensure(&self, allowed: &[JobStatus], to: JobStatus) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(IngestError::invalid_state_transition(self.id, self.status, to))
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Claimed by a runner.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[JobStatus::Queued, JobStatus::Failed], JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.next_retry_at = None;
        self.external_job_id = None;
        self.touch(now);
        Ok(())
    }

    /// Record the sync platform job id for the running attempt.
    pub fn attach_external_job(&mut self, external_job_id: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[JobStatus::Running], JobStatus::Running)?;
        self.external_job_id = Some(external_job_id.into());
        self.touch(now);
        Ok(())
    }

    pub fn mark_success(
        &mut self,
        records_synced: Option<u64>,
        bytes_synced: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(&[JobStatus::Running], JobStatus::Success)?;
        self.status = JobStatus::Success;
        self.records_synced = records_synced;
        self.bytes_synced = bytes_synced;
        self.error_message = None;
        self.error_category = None;
        self.completed_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Failed attempt that will be retried at `retry_at`.
    pub fn schedule_retry(
        &mut self,
        category: ErrorCategory,
        message: impl Into<String>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(&[JobStatus::Running], JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.retry_count += 1;
        self.next_retry_at = Some(retry_at);
        self.error_category = Some(category);
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.touch(now);
        Ok(())
    }

    pub fn mark_dead_letter(
        &mut self,
        category: ErrorCategory,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure(&[JobStatus::Running], JobStatus::DeadLetter)?;
        self.status = JobStatus::DeadLetter;
        self.next_retry_at = None;
        self.error_category = Some(category);
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.touch(now);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(
            &[
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Failed,
                JobStatus::DeadLetter,
            ],
            JobStatus::Cancelled,
        )?;
        self.status = JobStatus::Cancelled;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.touch(now);
        Ok(())
    }

    /// Move a dead-lettered job back to the queue with a fresh retry budget.
    /// The last error is kept so operators can see why it was parked.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure(&[JobStatus::DeadLetter], JobStatus::Queued)?;
        self.status = JobStatus::Queued;
        self.retry_count = 0;
        self.requeue_count += 1;
        self.next_retry_at = None;
        self.external_job_id = None;
        self.started_at = None;
        self.completed_at = None;
        self.touch(now);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
