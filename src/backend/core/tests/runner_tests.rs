//! Job runner tests against a scripted sync platform.
//!
//! Tests cover:
//! - Successful syncs, immediate and polled
//! - Retry scheduling and dead-lettering
//! - Status poll error tolerance
//! - Operator cancellation and sync timeouts
//! - Global and per-tenant capacity
//! - Panic isolation
//! - Stale job recovery
//! - Background loop start and shutdown

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ingest_core::jobs::{
    BackoffStrategy, ConnectorId, DispatchRequest, ErrorCategory, IngestionJob, InMemoryJobStore,
    JobDispatcher, JobOutcome, JobRunner, JobStatus, JobStore, RetryPolicy, RunnerConfig, TenantId,
};
use ingest_core::sync::{
    ExternalJobStatus, RateLimitConfig, RateLimitedSyncClient, RateLimiter, SyncApi, SyncError,
    SyncJobRef, SyncJobStatus,
};

// ============================================================================
// Scripted sync platform
// ============================================================================

/// Replays scripted responses; once a script runs dry, triggers start a
/// running sync and polls report it still running.
#[derive(Default)]
struct ScriptedSync {
    triggers: Mutex<VecDeque<Result<ExternalJobStatus, SyncError>>>,
    polls: Mutex<VecDeque<Result<SyncJobStatus, SyncError>>>,
    /// Status every unscripted trigger returns
    trigger_default: Mutex<Option<ExternalJobStatus>>,
    /// How long each trigger takes to return
    trigger_delay: Mutex<Option<Duration>>,
    cancelled: Mutex<Vec<String>>,
    next_id: AtomicU32,
    trigger_calls: AtomicU32,
    poll_calls: AtomicU32,
}

impl ScriptedSync {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push_trigger(&self, result: Result<ExternalJobStatus, SyncError>) {
        self.triggers.lock().push_back(result);
    }

    fn push_poll(&self, status: ExternalJobStatus, rows: Option<u64>) {
        self.polls.lock().push_back(Ok(SyncJobStatus {
            external_job_id: String::new(),
            status,
            rows_synced: rows,
            bytes_synced: rows.map(|r| r * 100),
            message: None,
        }));
    }

    fn push_poll_error(&self, error: SyncError) {
        self.polls.lock().push_back(Err(error));
    }

    fn triggers_succeed(&self) {
        *self.trigger_default.lock() = Some(ExternalJobStatus::Succeeded);
    }

    fn slow_triggers(&self, delay: Duration) {
        *self.trigger_delay.lock() = Some(delay);
    }

    fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl SyncApi for ScriptedSync {
    async fn trigger_sync(&self, connection_id: &str) -> Result<SyncJobRef, SyncError> {
        if connection_id.starts_with("panic") {
            panic!("sync client blew up for {}", connection_id);
        }
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.trigger_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.triggers.lock().pop_front();
        let status = match scripted {
            Some(result) => result?,
            None => self.trigger_default.lock().unwrap_or(ExternalJobStatus::Running),
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SyncJobRef {
            external_job_id: format!("ext-{}", id),
            status,
        })
    }

    async fn job_status(&self, external_job_id: &str) -> Result<SyncJobStatus, SyncError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.polls.lock().pop_front();
        match scripted {
            Some(Ok(mut status)) => {
                status.external_job_id = external_job_id.to_string();
                Ok(status)
            }
            Some(Err(e)) => Err(e),
            None => Ok(SyncJobStatus {
                external_job_id: external_job_id.to_string(),
                status: ExternalJobStatus::Running,
                rows_synced: None,
                bytes_synced: None,
                message: None,
            }),
        }
    }

    async fn cancel_job(&self, external_job_id: &str) -> Result<(), SyncError> {
        self.cancelled.lock().push(external_job_id.to_string());
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn tenant(s: &str) -> TenantId {
    TenantId::new(s).unwrap()
}

fn connector(s: &str) -> ConnectorId {
    ConnectorId::new(s).unwrap()
}

fn fast_config() -> RunnerConfig {
    RunnerConfig {
        name: "test-runner".to_string(),
        concurrency: 4,
        max_jobs_per_tenant: 2,
        poll_interval: Duration::from_millis(10),
        sync_poll_interval: Duration::from_millis(5),
        sync_timeout: Duration::from_secs(10),
        stale_after: Duration::from_secs(60),
        max_poll_errors: 3,
        shutdown_timeout: Duration::from_secs(1),
    }
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_retries(max_retries)
        .with_backoff(BackoffStrategy::fixed(Duration::from_secs(30)))
}

struct Harness {
    store: Arc<InMemoryJobStore>,
    sync: Arc<ScriptedSync>,
    runner: Arc<JobRunner>,
}

impl Harness {
    fn new(config: RunnerConfig, policy: RetryPolicy) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let sync = ScriptedSync::new();
        let runner = Arc::new(JobRunner::new(store.clone(), sync.clone(), policy, config));
        Self { store, sync, runner }
    }

    fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::new(self.store.clone()).with_sync_api(self.sync.clone())
    }

    async fn queue(&self, t: &str, c: &str) -> IngestionJob {
        self.dispatcher()
            .dispatch(DispatchRequest::new(tenant(t), connector(c), format!("conn-{}", c)))
            .await
            .unwrap()
            .into_job()
    }

    /// Queue a job and claim it the way the runner loop would.
    async fn claimed(&self, t: &str, c: &str) -> IngestionJob {
        let queued = self.queue(t, c).await;
        let claimed = self.store.claim_next(Utc::now(), &[]).await.unwrap().unwrap();
        assert_eq!(claimed.id, queued.id);
        claimed
    }

    async fn reload(&self, job: &IngestionJob) -> IngestionJob {
        self.store.get(&job.tenant_id, job.id).await.unwrap().unwrap()
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Success
// ============================================================================

#[tokio::test]
async fn test_polled_sync_succeeds() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_poll(ExternalJobStatus::Pending, None);
    h.sync.push_poll(ExternalJobStatus::Running, None);
    h.sync.push_poll(ExternalJobStatus::Succeeded, Some(250));

    let job = h.claimed("acme", "shopify").await;
    let outcome = h.runner.execute(job.clone()).await.unwrap();
    assert_eq!(outcome, JobOutcome::Succeeded);

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::Success);
    assert_eq!(stored.records_synced, Some(250));
    assert_eq!(stored.bytes_synced, Some(25_000));
    assert_eq!(stored.external_job_id.as_deref(), Some("ext-1"));
    assert!(stored.completed_at.is_some());
    assert_eq!(h.sync.poll_calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.runner.stats().succeeded(), 1);
}

#[tokio::test]
async fn test_terminal_trigger_skips_polling() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_trigger(Ok(ExternalJobStatus::Succeeded));

    let job = h.claimed("acme", "shopify").await;
    assert_eq!(h.runner.execute(job.clone()).await.unwrap(), JobOutcome::Succeeded);
    assert_eq!(h.sync.poll_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.reload(&job).await.status, JobStatus::Success);
}

#[tokio::test]
async fn test_platform_cancelled_sync_cancels_job() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_poll(ExternalJobStatus::Cancelled, None);

    let job = h.claimed("acme", "shopify").await;
    assert_eq!(h.runner.execute(job.clone()).await.unwrap(), JobOutcome::Cancelled);
    assert_eq!(h.reload(&job).await.status, JobStatus::Cancelled);
}

// ============================================================================
// Retry & Dead Letter
// ============================================================================

#[tokio::test]
async fn test_transient_trigger_failure_schedules_retry() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_trigger(Err(SyncError::Server {
        status: 502,
        message: "bad gateway".to_string(),
    }));

    let job = h.claimed("acme", "shopify").await;
    let before = Utc::now();
    let outcome = h.runner.execute(job.clone()).await.unwrap();
    let JobOutcome::RetryScheduled { at } = outcome else {
        panic!("expected a retry, got {:?}", outcome);
    };
    assert!(at >= before + chrono::Duration::seconds(29));

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.next_retry_at, Some(at));
    assert_eq!(stored.error_category, Some(ErrorCategory::ServerError));
    assert!(stored.error_message.unwrap().contains("bad gateway"));

    // Not claimable until the backoff elapses.
    assert!(h.store.claim_next(Utc::now(), &[]).await.unwrap().is_none());
    assert!(h
        .store
        .claim_next(at + chrono::Duration::seconds(1), &[])
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_rate_limit_uses_retry_after() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_trigger(Err(SyncError::RateLimited {
        retry_after: Some(Duration::from_secs(600)),
    }));

    let job = h.claimed("acme", "shopify").await;
    let before = Utc::now();
    let JobOutcome::RetryScheduled { at } = h.runner.execute(job).await.unwrap() else {
        panic!("expected a retry");
    };
    assert!(at >= before + chrono::Duration::seconds(599));
}

#[tokio::test]
async fn test_non_retryable_failure_dead_letters() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync
        .push_trigger(Err(SyncError::Unauthorized("token revoked".to_string())));

    let job = h.claimed("acme", "shopify").await;
    assert_eq!(h.runner.execute(job.clone()).await.unwrap(), JobOutcome::DeadLettered);

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::DeadLetter);
    assert_eq!(stored.retry_count, 0);
    assert_eq!(stored.error_category, Some(ErrorCategory::AuthError));
    assert!(stored.next_retry_at.is_none());

    // The connector slot is free again.
    let next = h.queue("acme", "shopify").await;
    assert_ne!(next.id, job.id);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let h = Harness::new(fast_config(), fast_policy(1));
    let job = h.queue("acme", "shopify").await;

    h.sync.push_trigger(Err(SyncError::Connection("reset".to_string())));
    h.sync.push_trigger(Err(SyncError::Connection("reset".to_string())));

    let first = h.store.claim_next(Utc::now(), &[]).await.unwrap().unwrap();
    assert!(matches!(
        h.runner.execute(first).await.unwrap(),
        JobOutcome::RetryScheduled { .. }
    ));

    let later = Utc::now() + chrono::Duration::minutes(5);
    let second = h.store.claim_next(later, &[]).await.unwrap().unwrap();
    assert_eq!(second.id, job.id);
    assert_eq!(h.runner.execute(second).await.unwrap(), JobOutcome::DeadLettered);

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::DeadLetter);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.error_category, Some(ErrorCategory::Connection));
}

#[tokio::test]
async fn test_external_failure_is_sync_failed() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_poll(ExternalJobStatus::Failed, None);

    let job = h.claimed("acme", "shopify").await;
    assert!(matches!(
        h.runner.execute(job.clone()).await.unwrap(),
        JobOutcome::RetryScheduled { .. }
    ));
    assert_eq!(
        h.reload(&job).await.error_category,
        Some(ErrorCategory::SyncFailed)
    );
}

// ============================================================================
// Poll Errors
// ============================================================================

#[tokio::test]
async fn test_poll_errors_below_threshold_are_tolerated() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_poll_error(SyncError::Timeout("slow".to_string()));
    h.sync.push_poll_error(SyncError::Timeout("slow".to_string()));
    h.sync.push_poll(ExternalJobStatus::Succeeded, Some(1));

    let job = h.claimed("acme", "shopify").await;
    assert_eq!(h.runner.execute(job).await.unwrap(), JobOutcome::Succeeded);
}

#[tokio::test]
async fn test_consecutive_poll_errors_fail_attempt() {
    let h = Harness::new(fast_config(), fast_policy(3));
    for _ in 0..3 {
        h.sync.push_poll_error(SyncError::Connection("refused".to_string()));
    }

    let job = h.claimed("acme", "shopify").await;
    assert!(matches!(
        h.runner.execute(job.clone()).await.unwrap(),
        JobOutcome::RetryScheduled { .. }
    ));
    assert_eq!(h.sync.poll_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.reload(&job).await.error_category,
        Some(ErrorCategory::Connection)
    );
    // The retry triggers a new sync, so the abandoned one is stopped.
    assert_eq!(h.sync.cancelled(), vec!["ext-1".to_string()]);
}

#[tokio::test]
async fn test_fatal_poll_error_fails_immediately() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.push_poll_error(SyncError::NotFound("job 1".to_string()));

    let job = h.claimed("acme", "shopify").await;
    assert_eq!(h.runner.execute(job).await.unwrap(), JobOutcome::DeadLettered);
    assert_eq!(h.sync.poll_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.sync.cancelled(), vec!["ext-1".to_string()]);
}

#[tokio::test]
async fn test_account_throttling_does_not_fail_running_sync() {
    let store = Arc::new(InMemoryJobStore::new());
    let scripted = ScriptedSync::new();
    let limiter = Arc::new(RateLimiter::in_memory(
        RateLimitConfig::builder()
            .account(6000, 100)
            .connection(6000, 100)
            .max_wait(Duration::from_millis(1))
            .build(),
    ));
    let client = Arc::new(RateLimitedSyncClient::new(scripted.clone(), limiter));
    // A single poll error would fail the attempt.
    let config = RunnerConfig {
        max_poll_errors: 1,
        ..fast_config()
    };
    let runner = Arc::new(JobRunner::new(store.clone(), client.clone(), fast_policy(3), config));

    let dispatcher = JobDispatcher::new(store.clone());
    let job = dispatcher
        .dispatch(DispatchRequest::new(tenant("acme"), connector("shopify"), "conn-shopify"))
        .await
        .unwrap()
        .into_job();
    store.claim_next(Utc::now(), &[]).await.unwrap().unwrap();

    let running = tokio::spawn({
        let runner = runner.clone();
        let job = job.clone();
        async move { runner.execute(job).await }
    });

    let store_ref = store.clone();
    let watched = job.clone();
    eventually(|| {
        let store = store_ref.clone();
        let watched = watched.clone();
        async move {
            store
                .get(&watched.tenant_id, watched.id)
                .await
                .unwrap()
                .is_some_and(|j| j.external_job_id.is_some())
        }
    })
    .await;

    // Another tenant's trigger hits an upstream 429 and cools the whole account down.
    scripted.push_trigger(Err(SyncError::RateLimited {
        retry_after: Some(Duration::from_millis(150)),
    }));
    let err = client.trigger_sync("conn-other").await.unwrap_err();
    assert!(matches!(err, SyncError::RateLimited { .. }));
    scripted.push_poll(ExternalJobStatus::Succeeded, Some(42));

    assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Succeeded);
    let done = store.get(&job.tenant_id, job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Success);
    assert_eq!(done.records_synced, Some(42));
    assert!(scripted.cancelled().is_empty());
}

// ============================================================================
// Cancellation & Timeout
// ============================================================================

#[tokio::test]
async fn test_operator_cancel_stops_running_job() {
    let h = Harness::new(fast_config(), fast_policy(3));
    let job = h.claimed("acme", "shopify").await;

    let runner = h.runner.clone();
    let running = tokio::spawn({
        let job = job.clone();
        async move { runner.execute(job).await }
    });

    let store = h.store.clone();
    let watched = job.clone();
    eventually(|| {
        let store = store.clone();
        let watched = watched.clone();
        async move {
            store
                .get(&watched.tenant_id, watched.id)
                .await
                .unwrap()
                .is_some_and(|j| j.external_job_id.is_some())
        }
    })
    .await;

    let cancelled = h.dispatcher().cancel(&job.tenant_id, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome, JobOutcome::Cancelled);
    assert_eq!(h.reload(&job).await.status, JobStatus::Cancelled);
    assert!(h.sync.cancelled().iter().all(|id| id == "ext-1"));
    assert!(!h.sync.cancelled().is_empty());
}

#[tokio::test]
async fn test_cancel_during_trigger_stops_new_sync() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.slow_triggers(Duration::from_millis(100));
    let job = h.claimed("acme", "shopify").await;

    let runner = h.runner.clone();
    let running = tokio::spawn({
        let job = job.clone();
        async move { runner.execute(job).await }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let cancelled = h.dispatcher().cancel(&job.tenant_id, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    // No external id was stored yet, so the dispatcher has nothing to cancel.
    assert!(h.sync.cancelled().is_empty());

    assert_eq!(running.await.unwrap().unwrap(), JobOutcome::Cancelled);
    assert_eq!(h.sync.cancelled(), vec!["ext-1".to_string()]);
    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::Cancelled);
    assert!(stored.external_job_id.is_none());
}

#[tokio::test]
async fn test_sync_timeout_cancels_and_retries() {
    let config = RunnerConfig {
        sync_timeout: Duration::from_millis(40),
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));

    let job = h.claimed("acme", "shopify").await;
    assert!(matches!(
        h.runner.execute(job.clone()).await.unwrap(),
        JobOutcome::RetryScheduled { .. }
    ));

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_category, Some(ErrorCategory::Timeout));
    assert_eq!(h.sync.cancelled(), vec!["ext-1".to_string()]);
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test]
async fn test_tick_respects_per_tenant_cap() {
    let config = RunnerConfig {
        max_jobs_per_tenant: 1,
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));
    h.queue("busy", "shopify").await;
    h.queue("busy", "ads").await;
    h.queue("busy", "email").await;
    h.queue("quiet", "shopify").await;

    let started = h.runner.tick().await.unwrap();
    assert_eq!(started, 2);

    let counts = h.store.count_by_status(&tenant("busy")).await.unwrap();
    assert_eq!(counts[&JobStatus::Running], 1);
    assert_eq!(counts[&JobStatus::Queued], 2);
    let counts = h.store.count_by_status(&tenant("quiet")).await.unwrap();
    assert_eq!(counts[&JobStatus::Running], 1);
    assert_eq!(h.runner.stats().active(), 2);
}

#[tokio::test]
async fn test_tick_respects_global_concurrency() {
    let config = RunnerConfig {
        concurrency: 2,
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));
    for t in ["a", "b", "c"] {
        h.queue(t, "shopify").await;
    }

    assert_eq!(h.runner.tick().await.unwrap(), 2);
    // No permits left until a job finishes.
    assert_eq!(h.runner.tick().await.unwrap(), 0);
    assert_eq!(h.runner.stats().claimed(), 2);
}

#[tokio::test]
async fn test_finished_jobs_free_capacity() {
    let config = RunnerConfig {
        concurrency: 1,
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));
    h.sync.triggers_succeed();
    h.queue("a", "shopify").await;
    h.queue("b", "shopify").await;

    assert_eq!(h.runner.tick().await.unwrap(), 1);
    h.runner.wait_idle().await;
    assert_eq!(h.runner.tick().await.unwrap(), 1);
    h.runner.wait_idle().await;

    assert_eq!(h.runner.stats().succeeded(), 2);
    assert_eq!(h.runner.stats().active(), 0);
}

#[tokio::test]
async fn test_panicking_job_is_isolated() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.triggers_succeed();

    let doomed = h
        .dispatcher()
        .dispatch(DispatchRequest::new(tenant("a"), connector("shopify"), "panic-conn"))
        .await
        .unwrap()
        .into_job();
    let healthy = h.queue("b", "shopify").await;

    assert_eq!(h.runner.tick().await.unwrap(), 2);
    h.runner.wait_idle().await;

    assert_eq!(h.reload(&healthy).await.status, JobStatus::Success);
    // The panicked job keeps its record; stale recovery takes it from here.
    assert_eq!(h.reload(&doomed).await.status, JobStatus::Running);
    assert_eq!(h.runner.stats().active(), 0);

    // Its capacity was released.
    h.queue("a", "ads").await;
    assert_eq!(h.runner.tick().await.unwrap(), 1);
}

// ============================================================================
// Stale Recovery
// ============================================================================

#[tokio::test]
async fn test_recover_stale_fails_orphaned_job() {
    let config = RunnerConfig {
        stale_after: Duration::ZERO,
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));

    // Claimed and triggered by a runner that then died.
    let mut job = h.claimed("acme", "shopify").await;
    job.attach_external_job("ext-orphan", Utc::now()).unwrap();
    assert!(h.store.update(&job, JobStatus::Running).await.unwrap().is_applied());
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(h.runner.recover_stale().await.unwrap(), 1);

    let stored = h.reload(&job).await;
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error_category, Some(ErrorCategory::Timeout));
    assert_eq!(stored.retry_count, 1);
    assert_eq!(h.sync.cancelled(), vec!["ext-orphan".to_string()]);

    assert_eq!(h.runner.recover_stale().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recover_stale_ignores_fresh_jobs() {
    let h = Harness::new(fast_config(), fast_policy(3));
    let job = h.claimed("acme", "shopify").await;

    assert_eq!(h.runner.recover_stale().await.unwrap(), 0);
    assert_eq!(h.reload(&job).await.status, JobStatus::Running);
}

// ============================================================================
// Background Loop
// ============================================================================

#[tokio::test]
async fn test_start_runs_jobs_until_shutdown() {
    let h = Harness::new(fast_config(), fast_policy(3));
    h.sync.triggers_succeed();
    let job = h.queue("acme", "shopify").await;

    let handle = h.runner.clone().start();

    let store = h.store.clone();
    let watched = job.clone();
    eventually(|| {
        let store = store.clone();
        let watched = watched.clone();
        async move {
            store.get(&watched.tenant_id, watched.id).await.unwrap().map(|j| j.status)
                == Some(JobStatus::Success)
        }
    })
    .await;

    let stats = handle.stats().clone();
    handle.shutdown().await;
    assert_eq!(stats.claimed(), 1);
    assert_eq!(stats.succeeded(), 1);
}

#[tokio::test]
async fn test_shutdown_aborts_hung_jobs_after_timeout() {
    let config = RunnerConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let h = Harness::new(config, fast_policy(3));
    let job = h.queue("acme", "shopify").await;

    let handle = h.runner.clone().start();
    let store = h.store.clone();
    let watched = job.clone();
    eventually(|| {
        let store = store.clone();
        let watched = watched.clone();
        async move {
            store.get(&watched.tenant_id, watched.id).await.unwrap().map(|j| j.status)
                == Some(JobStatus::Running)
        }
    })
    .await;

    let stopped = tokio::time::timeout(Duration::from_secs(2), handle.shutdown()).await;
    assert!(stopped.is_ok());
    assert_eq!(h.runner.stats().active(), 0);
    assert_eq!(h.reload(&job).await.status, JobStatus::Running);
}
