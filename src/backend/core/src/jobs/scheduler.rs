//! Interval scheduling of connector syncs.
//!
//! Each schedule periodically dispatches an ingestion job for one
//! (tenant, connector). Dispatch is idempotent, so a schedule firing while
//! the previous job is still active simply finds that job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::jobs::dispatcher::{DispatchOutcome, DispatchRequest, JobDispatcher};
use crate::jobs::job::{ConnectorId, TenantId};

/// Identifier of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A schedule as written in configuration (`[[schedules]]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    pub external_connection_id: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Fire on the first tick instead of after one interval
    #[serde(default = "default_run_immediately")]
    pub run_immediately: bool,
}

fn default_run_immediately() -> bool {
    true
}

/// A recurring sync.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledSync {
    pub id: ScheduleId,
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    pub external_connection_id: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Whether this schedule is active
    pub active: bool,
    /// Next scheduled dispatch
    pub next_run: DateTime<Utc>,
    /// Last successful dispatch
    pub last_run: Option<DateTime<Utc>>,
    /// Number of successful dispatches
    pub run_count: u64,
}

fn chrono_interval(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Scheduler managing recurring syncs.
#[derive(Default)]
pub struct SyncScheduler {
    schedules: RwLock<Vec<ScheduledSync>>,
}

impl SyncScheduler {
    /// Create a new scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scheduler from configured entries.
    pub async fn from_config(entries: &[ScheduleConfig]) -> Result<Self> {
        let scheduler = Self::new();
        for entry in entries {
            scheduler
                .schedule_interval(
                    entry.tenant_id.clone(),
                    entry.connector_id.clone(),
                    entry.external_connection_id.clone(),
                    entry.interval,
                    entry.run_immediately,
                )
                .await?;
        }
        Ok(scheduler)
    }

    /// Schedule a connector sync at fixed intervals.
    pub async fn schedule_interval(
        &self,
        tenant_id: TenantId,
        connector_id: ConnectorId,
        external_connection_id: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
    ) -> Result<ScheduleId> {
        if interval.is_zero() {
            return Err(IngestError::invalid_input("interval", "must be greater than zero"));
        }
        let external_connection_id = external_connection_id.into();
        if external_connection_id.trim().is_empty() {
            return Err(IngestError::invalid_input(
                "external_connection_id",
                "must not be empty",
            ));
        }

        let now = Utc::now();
        let id = ScheduleId::new();
        let scheduled = ScheduledSync {
            id,
            tenant_id,
            connector_id,
            external_connection_id,
            interval,
            active: true,
            next_run: if run_immediately {
                now
            } else {
                now + chrono_interval(interval)
            },
            last_run: None,
            run_count: 0,
        };

        info!(
            schedule_id = %id,
            tenant_id = %scheduled.tenant_id,
            connector_id = %scheduled.connector_id,
            interval_secs = interval.as_secs(),
            "Sync scheduled"
        );
        self.schedules.write().await.push(scheduled);
        Ok(id)
    }

    /// Cancel a schedule.
    pub async fn cancel(&self, id: ScheduleId) -> bool {
        let mut schedules = self.schedules.write().await;
        if let Some(s) = schedules.iter_mut().find(|s| s.id == id) {
            s.active = false;
            true
        } else {
            false
        }
    }

    /// List active schedules.
    pub async fn list(&self) -> Vec<ScheduledSync> {
        self.schedules
            .read()
            .await
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Dispatch every schedule due at `now`. Returns the number dispatched.
    ///
    /// A failed dispatch leaves the schedule due so it is retried next tick.
    pub async fn run_due(&self, now: DateTime<Utc>, dispatcher: &JobDispatcher) -> usize {
        let mut schedules = self.schedules.write().await;
        let mut dispatched = 0;

        for schedule in schedules.iter_mut().filter(|s| s.active && s.next_run <= now) {
            let request = DispatchRequest::new(
                schedule.tenant_id.clone(),
                schedule.connector_id.clone(),
                schedule.external_connection_id.clone(),
            )
            .with_metadata(serde_json::json!({
                "triggered_by": "schedule",
                "schedule_id": schedule.id,
            }));

            match dispatcher.dispatch(request).await {
                Ok(outcome) => {
                    match &outcome {
                        DispatchOutcome::Created(job) => {
                            debug!(schedule_id = %schedule.id, job_id = %job.id, "Scheduled sync dispatched")
                        }
                        DispatchOutcome::AlreadyActive(job) => {
                            debug!(schedule_id = %schedule.id, job_id = %job.id, "Scheduled sync already active")
                        }
                    }
                    schedule.last_run = Some(now);
                    schedule.run_count += 1;
                    schedule.next_run = now + chrono_interval(schedule.interval);
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(
                        schedule_id = %schedule.id,
                        tenant_id = %schedule.tenant_id,
                        connector_id = %schedule.connector_id,
                        error = %e,
                        "Scheduled dispatch failed"
                    );
                }
            }
        }

        dispatched
    }

    /// Run [`Self::run_due`] every `tick` until `shutdown` is cancelled.
    pub fn start(
        self: Arc<Self>,
        dispatcher: Arc<JobDispatcher>,
        tick: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(tick_ms = tick.as_millis() as u64, "Sync scheduler started");
            loop {
                self.run_due(Utc::now(), &dispatcher).await;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }
            }
            info!("Sync scheduler stopped");
        })
    }
}
