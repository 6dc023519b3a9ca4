//! Job runner: claims runnable jobs and drives their external syncs.
//!
//! Each claimed job runs on its own task. Capacity is bounded globally
//! (`concurrency`) and per tenant (`max_jobs_per_tenant`); saturated tenants
//! are skipped when claiming so one busy tenant cannot starve the others.
//! A job that fails, hangs or panics only affects its own record.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::jobs::job::{IngestionJob, JobId, JobStatus, TenantId};
use crate::jobs::retry::{classify, RetryAction, RetryPolicy};
use crate::jobs::store::{JobStore, UpdateOutcome};
use crate::sync::{ExternalJobStatus, SyncApi, SyncError};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the job runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Runner name/identifier
    pub name: String,
    /// Maximum jobs in flight across all tenants
    pub concurrency: usize,
    /// Maximum jobs in flight for a single tenant
    pub max_jobs_per_tenant: usize,
    /// How often the queue is polled for runnable jobs
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How often a running external sync is polled
    #[serde(with = "humantime_serde")]
    pub sync_poll_interval: Duration,
    /// Longest an external sync may run before it is cancelled
    #[serde(with = "humantime_serde")]
    pub sync_timeout: Duration,
    /// Running jobs older than this are considered orphaned
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// Consecutive failed status polls after which the attempt fails
    pub max_poll_errors: u32,
    /// Time allowed for in-flight jobs to finish on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let sync_timeout = Duration::from_secs(6 * 60 * 60);
        Self {
            name: "ingest-runner".to_string(),
            concurrency: 8,
            max_jobs_per_tenant: 2,
            poll_interval: Duration::from_secs(5),
            sync_poll_interval: Duration::from_secs(15),
            sync_timeout,
            stale_after: sync_timeout + Duration::from_secs(30 * 60),
            max_poll_errors: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stats & Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// How an execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded,
    RetryScheduled { at: DateTime<Utc> },
    DeadLettered,
    Cancelled,
    /// The record changed underneath the runner; nothing was written.
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Statistics for the job runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Jobs claimed from the store
    pub claimed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Failed attempts scheduled for retry
    pub retried: Arc<AtomicU64>,
    pub dead_lettered: Arc<AtomicU64>,
    pub cancelled: Arc<AtomicU64>,
    pub abandoned: Arc<AtomicU64>,
    /// Currently running jobs
    pub active: Arc<AtomicU64>,
}

impl RunnerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Succeeded => &self.succeeded,
            JobOutcome::RetryScheduled { .. } => &self.retried,
            JobOutcome::DeadLettered => &self.dead_lettered,
            JobOutcome::Cancelled => &self.cancelled,
            JobOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        counter!("ingest_job_outcomes_total", "outcome" => outcome.as_str()).increment(1);
    }
}

/// Handle for controlling a running runner.
pub struct RunnerHandle {
    shutdown: CancellationToken,
    join: JoinHandle<()>,
    stats: RunnerStats,
}

impl RunnerHandle {
    /// Stop claiming, wait for in-flight jobs (bounded by `shutdown_timeout`).
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Runner loop terminated abnormally");
        }
    }

    /// Token that stops the runner when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Get runner statistics.
    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-flight bookkeeping
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct InFlight {
    per_tenant: Mutex<HashMap<TenantId, usize>>,
    jobs: Mutex<HashSet<JobId>>,
}

impl InFlight {
    fn saturated_tenants(&self, max_per_tenant: usize) -> Vec<TenantId> {
        self.per_tenant
            .lock()
            .iter()
            .filter(|(_, n)| **n >= max_per_tenant)
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn contains(&self, id: &JobId) -> bool {
        self.jobs.lock().contains(id)
    }
}

/// Releases a job's capacity when its task ends, including by panic or abort.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    stats: RunnerStats,
    tenant_id: TenantId,
    job_id: JobId,
    _permit: OwnedSemaphorePermit,
}

impl InFlightGuard {
    fn new(
        in_flight: Arc<InFlight>,
        stats: RunnerStats,
        job: &IngestionJob,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        *in_flight
            .per_tenant
            .lock()
            .entry(job.tenant_id.clone())
            .or_default() += 1;
        in_flight.jobs.lock().insert(job.id);
        let active = stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("ingest_jobs_in_flight").set(active as f64);

        Self {
            in_flight,
            stats,
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            _permit: permit,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        {
            let mut per_tenant = self.in_flight.per_tenant.lock();
            if let Some(n) = per_tenant.get_mut(&self.tenant_id) {
                *n = n.saturating_sub(1);
                if *n == 0 {
                    per_tenant.remove(&self.tenant_id);
                }
            }
        }
        self.in_flight.jobs.lock().remove(&self.job_id);
        let active = self.stats.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        gauge!("ingest_jobs_in_flight").set(active as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes ingestion jobs against the sync platform.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    sync: Arc<dyn SyncApi>,
    policy: RetryPolicy,
    config: RunnerConfig,
    stats: RunnerStats,
    permits: Arc<Semaphore>,
    in_flight: Arc<InFlight>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        sync: Arc<dyn SyncApi>,
        policy: RetryPolicy,
        config: RunnerConfig,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            store,
            sync,
            policy,
            config,
            stats: RunnerStats::new(),
            in_flight: Arc::new(InFlight::default()),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn stats(&self) -> &RunnerStats {
        &self.stats
    }

    /// Start the polling loop, returning a handle for control.
    pub fn start(self: Arc<Self>) -> RunnerHandle {
        let token = CancellationToken::new();
        let stats = self.stats.clone();
        let loop_token = token.clone();

        let join = tokio::spawn(async move {
            info!(
                runner = %self.config.name,
                concurrency = self.config.concurrency,
                max_jobs_per_tenant = self.config.max_jobs_per_tenant,
                "Job runner started"
            );

            loop {
                if let Err(e) = self.tick().await {
                    e.log();
                }

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }

            info!(runner = %self.config.name, "Runner shutting down");
            self.drain(self.config.shutdown_timeout).await;
            info!(runner = %self.config.name, "Runner stopped");
        });

        RunnerHandle {
            shutdown: token,
            join,
            stats,
        }
    }

    /// Recover stale jobs, then claim and spawn as many jobs as capacity
    /// allows. Returns the number of jobs started.
    pub async fn tick(self: &Arc<Self>) -> Result<usize> {
        self.reap_finished().await;

        if let Err(e) = self.recover_stale().await {
            e.log();
        }

        let mut started = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("Runner at global capacity");
                break;
            };

            let skip = self
                .in_flight
                .saturated_tenants(self.config.max_jobs_per_tenant.max(1));
            let Some(job) = self.store.claim_next(Utc::now(), &skip).await? else {
                break;
            };

            self.stats.claimed.fetch_add(1, Ordering::Relaxed);
            counter!("ingest_jobs_claimed_total").increment(1);
            self.spawn(job, permit).await;
            started += 1;
        }

        Ok(started)
    }

    async fn spawn(self: &Arc<Self>, job: IngestionJob, permit: OwnedSemaphorePermit) {
        let span = info_span!(
            "ingest_job",
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            connector_id = %job.connector_id,
            attempt = job.retry_count + 1,
        );
        let guard = InFlightGuard::new(self.in_flight.clone(), self.stats.clone(), &job, permit);
        let runner = Arc::clone(self);

        self.tasks.lock().await.spawn(
            async move {
                let _guard = guard;
                let job_id = job.id;
                if let Err(e) = runner.execute(job).await {
                    // The job stays running and is picked up by stale recovery.
                    warn!(%job_id, error = %e, "Job execution aborted by store error");
                }
            }
            .instrument(span),
        );
    }

    /// Collect finished tasks without waiting, surfacing panics.
    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(Some(result)) = tasks.join_next().now_or_never() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Job task panicked");
                    counter!("ingest_job_panics_total").increment(1);
                }
            }
        }
    }

    /// Wait for every in-flight job to finish.
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Job task panicked");
                    counter!("ingest_job_panics_total").increment(1);
                }
            }
        }
    }

    async fn drain(&self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_err() {
            let mut tasks = self.tasks.lock().await;
            warn!(remaining = tasks.len(), "Shutdown timeout reached, aborting in-flight jobs");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────────

    /// Drive one claimed (`running`) job to its next state.
    pub async fn execute(&self, mut job: IngestionJob) -> Result<JobOutcome> {
        let started = std::time::Instant::now();
        let outcome = self.run_attempt(&mut job).await?;

        histogram!("ingest_job_duration_seconds", "outcome" => outcome.as_str())
            .record(started.elapsed().as_secs_f64());
        self.stats.record(&outcome);
        info!(outcome = outcome.as_str(), "Job attempt finished");
        Ok(outcome)
    }

    async fn run_attempt(&self, job: &mut IngestionJob) -> Result<JobOutcome> {
        let triggered = match self.sync.trigger_sync(&job.external_connection_id).await {
            Ok(triggered) => triggered,
            Err(e) => return self.fail(job, e).await,
        };

        job.attach_external_job(&triggered.external_job_id, Utc::now())?;
        if !self.persist(job).await? {
            // The external id never reached the store, so nothing else can stop this sync.
            self.cancel_external(&triggered.external_job_id).await;
            return match self.store.get(&job.tenant_id, job.id).await? {
                Some(current) if current.status == JobStatus::Cancelled => {
                    info!("Job cancelled while triggering");
                    Ok(JobOutcome::Cancelled)
                }
                _ => Ok(JobOutcome::Abandoned),
            };
        }
        debug!(external_job_id = %triggered.external_job_id, "External sync started");

        if let Some(outcome) = self.finish(job, triggered.status, None, None, None).await? {
            return Ok(outcome);
        }

        self.poll_until_done(job, &triggered.external_job_id).await
    }

    async fn poll_until_done(&self, job: &mut IngestionJob, external_job_id: &str) -> Result<JobOutcome> {
        let deadline = tokio::time::Instant::now() + self.config.sync_timeout;
        let mut poll_errors = 0u32;

        loop {
            tokio::time::sleep(self.config.sync_poll_interval).await;

            // Operator actions land in the store; stop before touching the platform.
            match self.store.get(&job.tenant_id, job.id).await? {
                Some(current) if current.status == JobStatus::Running => {}
                Some(current) if current.status == JobStatus::Cancelled => {
                    info!("Job cancelled while running");
                    self.cancel_external(external_job_id).await;
                    return Ok(JobOutcome::Cancelled);
                }
                Some(current) => {
                    warn!(status = %current.status, "Job changed while running, abandoning");
                    return Ok(JobOutcome::Abandoned);
                }
                None => return Ok(JobOutcome::Abandoned),
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(timeout_secs = self.config.sync_timeout.as_secs(), "External sync timed out");
                self.cancel_external(external_job_id).await;
                let error = SyncError::Timeout(format!(
                    "sync {} did not finish within {}s",
                    external_job_id,
                    self.config.sync_timeout.as_secs()
                ));
                return self.fail(job, error).await;
            }

            match self.sync.job_status(external_job_id).await {
                Ok(status) => {
                    poll_errors = 0;
                    if let Some(outcome) = self
                        .finish(job, status.status, status.rows_synced, status.bytes_synced, status.message)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }
                Err(SyncError::RateLimited { retry_after }) => {
                    // Account throttling says nothing about this sync's health.
                    let wait = retry_after
                        .unwrap_or(self.config.sync_poll_interval)
                        .min(deadline.saturating_duration_since(tokio::time::Instant::now()));
                    debug!(wait_ms = wait.as_millis() as u64, "Sync status poll rate limited");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    poll_errors += 1;
                    let fatal = !classify(&e).is_retryable();
                    if fatal || poll_errors >= self.config.max_poll_errors.max(1) {
                        self.cancel_external(external_job_id).await;
                        return self.fail(job, e).await;
                    }
                    warn!(error = %e, poll_errors, "Sync status poll failed");
                }
            }
        }
    }

    /// Apply a terminal external status; `None` while the sync is still going.
    async fn finish(
        &self,
        job: &mut IngestionJob,
        status: ExternalJobStatus,
        rows: Option<u64>,
        bytes: Option<u64>,
        message: Option<String>,
    ) -> Result<Option<JobOutcome>> {
        let now = Utc::now();
        let outcome = match status {
            ExternalJobStatus::Pending | ExternalJobStatus::Running => return Ok(None),
            ExternalJobStatus::Succeeded => {
                job.mark_success(rows, bytes, now)?;
                if !self.persist(job).await? {
                    return Ok(Some(JobOutcome::Abandoned));
                }
                JobOutcome::Succeeded
            }
            ExternalJobStatus::Cancelled => {
                job.mark_cancelled(now)?;
                if !self.persist(job).await? {
                    return Ok(Some(JobOutcome::Abandoned));
                }
                counter!("ingest_jobs_cancelled_total", "source" => "platform").increment(1);
                JobOutcome::Cancelled
            }
            ExternalJobStatus::Failed | ExternalJobStatus::Incomplete => {
                let error = SyncError::SyncFailed {
                    message: message.unwrap_or_else(|| format!("external status {}", status)),
                };
                return self.fail(job, error).await.map(Some);
            }
        };
        Ok(Some(outcome))
    }

    /// Classify a failed attempt and schedule a retry or dead-letter it.
    async fn fail(&self, job: &mut IngestionJob, error: SyncError) -> Result<JobOutcome> {
        let now = Utc::now();
        let decision = self.policy.decide(job.retry_count, &error, now);
        counter!("ingest_job_failures_total", "category" => decision.category.as_str()).increment(1);

        let outcome = match decision.action {
            RetryAction::Retry { delay, at } => {
                warn!(
                    category = %decision.category,
                    retry_count = job.retry_count + 1,
                    delay_secs = delay.as_secs(),
                    error = %error,
                    "Attempt failed, retry scheduled"
                );
                job.schedule_retry(decision.category, error.to_string(), at, now)?;
                JobOutcome::RetryScheduled { at }
            }
            RetryAction::DeadLetter { reason } => {
                error!(category = %decision.category, %reason, "Job moved to dead letter queue");
                job.mark_dead_letter(decision.category, reason, now)?;
                JobOutcome::DeadLettered
            }
        };

        if self.persist(job).await? {
            Ok(outcome)
        } else {
            Ok(JobOutcome::Abandoned)
        }
    }

    /// Compare-and-set from `running`. `false` when the record moved on.
    async fn persist(&self, job: &IngestionJob) -> Result<bool> {
        match self.store.update(job, JobStatus::Running).await? {
            UpdateOutcome::Applied => Ok(true),
            UpdateOutcome::StatusChanged(current) => {
                warn!(status = %current.status, "Job changed underneath runner");
                Ok(false)
            }
        }
    }

    async fn cancel_external(&self, external_job_id: &str) {
        if let Err(e) = self.sync.cancel_job(external_job_id).await {
            warn!(external_job_id, error = %e, "External sync cancel failed");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Fail running jobs that have been running longer than `stale_after`.
    ///
    /// Jobs executing in this runner are left alone.
    pub async fn recover_stale(&self) -> Result<usize> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - stale_after;
        let stale = self.store.list_stale_running(cutoff, 100).await?;

        let mut recovered = 0;
        for mut job in stale {
            if self.in_flight.contains(&job.id) {
                continue;
            }

            let span = info_span!("recover_stale", job_id = %job.id, tenant_id = %job.tenant_id);
            let outcome = async {
                warn!(started_at = ?job.started_at, "Recovering stale running job");
                if let Some(external_job_id) = job.external_job_id.clone() {
                    self.cancel_external(&external_job_id).await;
                }
                let error = SyncError::Timeout(format!(
                    "job made no progress for {}s",
                    self.config.stale_after.as_secs()
                ));
                self.fail(&mut job, error).await
            }
            .instrument(span)
            .await?;

            if outcome != JobOutcome::Abandoned {
                self.stats.record(&outcome);
                recovered += 1;
            }
        }

        if recovered > 0 {
            counter!("ingest_jobs_recovered_total").increment(recovered as u64);
        }
        Ok(recovered)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
