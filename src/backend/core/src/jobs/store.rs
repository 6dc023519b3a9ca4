//! Persistence seam for ingestion jobs.
//!
//! [`JobStore`] is implemented by [`InMemoryJobStore`] for tests and local
//! development and by [`crate::db::PostgresJobStore`] in production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{IngestError, Result};
use crate::jobs::job::{ConnectorId, IngestionJob, JobId, JobStatus, TenantId};

/// Default page size for [`JobStore::list`].
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Largest page size accepted by [`JobStore::list`].
pub const MAX_LIST_LIMIT: u32 = 500;

/// Result of [`JobStore::insert_if_no_active`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(IngestionJob),
    /// The connector already had an active job; nothing was written.
    ActiveExists(IngestionJob),
}

/// Result of a compare-and-set [`JobStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Applied,
    /// The stored status no longer matched; carries the stored record.
    StatusChanged(IngestionJob),
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Filter for listing a tenant's jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub connector_id: Option<ConnectorId>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_connector(mut self, connector_id: ConnectorId) -> Self {
        self.connector_id = Some(connector_id);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Page size after applying the default and the upper bound.
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    pub fn matches(&self, job: &IngestionJob) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .connector_id
                .as_ref()
                .map_or(true, |c| &job.connector_id == c)
    }
}

/// Storage operations needed by the dispatcher and runner.
///
/// All tenant-facing lookups are scoped by tenant: a job owned by another
/// tenant behaves exactly like a missing one.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job` unless its (tenant, connector) already has an active job.
    async fn insert_if_no_active(&self, job: IngestionJob) -> Result<InsertOutcome>;

    async fn get(&self, tenant_id: &TenantId, id: JobId) -> Result<Option<IngestionJob>>;

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        connector_id: &ConnectorId,
    ) -> Result<Option<IngestionJob>>;

    /// Newest first.
    async fn list(&self, tenant_id: &TenantId, filter: &JobFilter) -> Result<Vec<IngestionJob>>;

    /// Persist `job` if the stored status still equals `expected`.
    ///
    /// Fails with `ActiveJobExists` when the write would give the connector
    /// a second active job.
    async fn update(&self, job: &IngestionJob, expected: JobStatus) -> Result<UpdateOutcome>;

    /// Claim the oldest runnable job whose tenant is not in `skip_tenants`
    /// and move it to `running`.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        skip_tenants: &[TenantId],
    ) -> Result<Option<IngestionJob>>;

    /// Running jobs started before `started_before`, across all tenants.
    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>>;

    /// Job counts per status for a tenant. Every status is present.
    async fn count_by_status(&self, tenant_id: &TenantId) -> Result<HashMap<JobStatus, u64>>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn insert_if_no_active(&self, job: IngestionJob) -> Result<InsertOutcome> {
        (**self).insert_if_no_active(job).await
    }

    async fn get(&self, tenant_id: &TenantId, id: JobId) -> Result<Option<IngestionJob>> {
        (**self).get(tenant_id, id).await
    }

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        connector_id: &ConnectorId,
    ) -> Result<Option<IngestionJob>> {
        (**self).find_active(tenant_id, connector_id).await
    }

    async fn list(&self, tenant_id: &TenantId, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        (**self).list(tenant_id, filter).await
    }

    async fn update(&self, job: &IngestionJob, expected: JobStatus) -> Result<UpdateOutcome> {
        (**self).update(job, expected).await
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        skip_tenants: &[TenantId],
    ) -> Result<Option<IngestionJob>> {
        (**self).claim_next(now, skip_tenants).await
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>> {
        (**self).list_stale_running(started_before, limit).await
    }

    async fn count_by_status(&self, tenant_id: &TenantId) -> Result<HashMap<JobStatus, u64>> {
        (**self).count_by_status(tenant_id).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local job store. A single lock makes every operation atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, IngestionJob>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored jobs (all tenants).
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn active_for<'a>(
    jobs: &'a HashMap<JobId, IngestionJob>,
    tenant_id: &TenantId,
    connector_id: &ConnectorId,
) -> Option<&'a IngestionJob> {
    jobs.values().find(|j| {
        j.status.is_active() && &j.tenant_id == tenant_id && &j.connector_id == connector_id
    })
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_if_no_active(&self, job: IngestionJob) -> Result<InsertOutcome> {
        let mut jobs = self.jobs.write().await;

        if job.status.is_active() {
            if let Some(existing) = active_for(&jobs, &job.tenant_id, &job.connector_id) {
                return Ok(InsertOutcome::ActiveExists(existing.clone()));
            }
        }
        if jobs.contains_key(&job.id) {
            return Err(IngestError::new(
                crate::error::ErrorCode::DuplicateRecord,
                format!("Job {} already exists", job.id),
            ));
        }

        jobs.insert(job.id, job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get(&self, tenant_id: &TenantId, id: JobId) -> Result<Option<IngestionJob>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id).filter(|j| &j.tenant_id == tenant_id).cloned())
    }

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        connector_id: &ConnectorId,
    ) -> Result<Option<IngestionJob>> {
        let jobs = self.jobs.read().await;
        Ok(active_for(&jobs, tenant_id, connector_id).cloned())
    }

    async fn list(&self, tenant_id: &TenantId, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<IngestionJob> = jobs
            .values()
            .filter(|j| &j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        matching.truncate(filter.effective_limit() as usize);
        Ok(matching)
    }

    async fn update(&self, job: &IngestionJob, expected: JobStatus) -> Result<UpdateOutcome> {
        let mut jobs = self.jobs.write().await;

        let stored = match jobs.get(&job.id) {
            Some(stored) if stored.tenant_id == job.tenant_id => stored,
            _ => return Err(IngestError::job_not_found(job.id)),
        };
        if stored.status != expected {
            return Ok(UpdateOutcome::StatusChanged(stored.clone()));
        }

        if job.status.is_active() {
            let other = jobs.values().find(|j| {
                j.id != job.id
                    && j.status.is_active()
                    && j.tenant_id == job.tenant_id
                    && j.connector_id == job.connector_id
            });
            if let Some(other) = other {
                return Err(IngestError::active_job_exists(&job.connector_id, other.id));
            }
        }

        jobs.insert(job.id, job.clone());
        Ok(UpdateOutcome::Applied)
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        skip_tenants: &[TenantId],
    ) -> Result<Option<IngestionJob>> {
        let mut jobs = self.jobs.write().await;

        let next = jobs
            .values()
            .filter(|j| j.is_runnable(now) && !skip_tenants.contains(&j.tenant_id))
            .min_by(|a, b| {
                a.ready_at()
                    .cmp(&b.ready_at())
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_running(now)?;
        Ok(Some(job.clone()))
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>> {
        let jobs = self.jobs.read().await;
        let mut stale: Vec<IngestionJob> = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.started_at.map_or(true, |started| started < started_before)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn count_by_status(&self, tenant_id: &TenantId) -> Result<HashMap<JobStatus, u64>> {
        let jobs = self.jobs.read().await;
        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for job in jobs.values().filter(|j| &j.tenant_id == tenant_id) {
            *counts.entry(job.status).or_default() += 1;
        }
        Ok(counts)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::retry::ErrorCategory;
    use chrono::Duration;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    fn connector(s: &str) -> ConnectorId {
        ConnectorId::new(s).unwrap()
    }

    fn job(t: &str, c: &str) -> IngestionJob {
        IngestionJob::new(tenant(t), connector(c), format!("conn-{}", c))
    }

    #[tokio::test]
    async fn test_insert_rejects_second_active_job() {
        let store = InMemoryJobStore::new();
        let first = job("t1", "shopify");

        let outcome = store.insert_if_no_active(first.clone()).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));

        match store.insert_if_no_active(job("t1", "shopify")).await.unwrap() {
            InsertOutcome::ActiveExists(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected ActiveExists, got {:?}", other),
        }

        // Other tenant, same connector id
        let outcome = store.insert_if_no_active(job("t2", "shopify")).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_get_is_tenant_scoped() {
        let store = InMemoryJobStore::new();
        let j = job("t1", "shopify");
        store.insert_if_no_active(j.clone()).await.unwrap();

        assert!(store.get(&tenant("t1"), j.id).await.unwrap().is_some());
        assert!(store.get(&tenant("t2"), j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_compare_and_set() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let mut j = job("t1", "shopify");
        store.insert_if_no_active(j.clone()).await.unwrap();

        j.mark_running(now).unwrap();
        assert!(store.update(&j, JobStatus::Queued).await.unwrap().is_applied());

        // Stale writer still believes the job is queued
        let mut stale = j.clone();
        stale.status = JobStatus::Queued;
        stale.mark_cancelled(now).unwrap();
        match store.update(&stale, JobStatus::Queued).await.unwrap() {
            UpdateOutcome::StatusChanged(current) => assert_eq!(current.status, JobStatus::Running),
            other => panic!("expected StatusChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_rejects_second_active() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut parked = job("t1", "shopify");
        parked.mark_running(now).unwrap();
        parked
            .mark_dead_letter(ErrorCategory::AuthError, "revoked", now)
            .unwrap();
        store.insert_if_no_active(parked.clone()).await.unwrap();
        store.insert_if_no_active(job("t1", "shopify")).await.unwrap();

        parked.requeue(now).unwrap();
        let err = store.update(&parked, JobStatus::DeadLetter).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ActiveJobExists);
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let store = InMemoryJobStore::new();
        let err = store.update(&job("t1", "x"), JobStatus::Queued).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_claim_order_and_skip() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut old = job("t1", "a");
        old.created_at = now - Duration::minutes(10);
        let mut newer = job("t2", "b");
        newer.created_at = now - Duration::minutes(5);
        store.insert_if_no_active(old.clone()).await.unwrap();
        store.insert_if_no_active(newer.clone()).await.unwrap();

        let claimed = store.claim_next(now, &[tenant("t1")]).await.unwrap().unwrap();
        assert_eq!(claimed.id, newer.id);
        assert_eq!(claimed.status, JobStatus::Running);

        let claimed = store.claim_next(now, &[]).await.unwrap().unwrap();
        assert_eq!(claimed.id, old.id);
        assert!(store.claim_next(now, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_next_retry_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut j = job("t1", "a");
        j.mark_running(now).unwrap();
        j.schedule_retry(ErrorCategory::Timeout, "slow", now + Duration::minutes(1), now)
            .unwrap();
        store.insert_if_no_active(j.clone()).await.unwrap();

        assert!(store.claim_next(now, &[]).await.unwrap().is_none());
        let claimed = store
            .claim_next(now + Duration::minutes(2), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.retry_count, 1);
        assert!(claimed.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_limits() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for i in 0..5 {
            let mut j = job("t1", &format!("c{}", i));
            j.created_at = now - Duration::minutes(i);
            store.insert_if_no_active(j).await.unwrap();
        }
        store.insert_if_no_active(job("t2", "c0")).await.unwrap();

        let all = store.list(&tenant("t1"), &JobFilter::new()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].connector_id.as_str(), "c0");

        let limited = store
            .list(&tenant("t1"), &JobFilter::new().with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let one = store
            .list(&tenant("t1"), &JobFilter::new().with_connector(connector("c3")))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);

        let none = store
            .list(&tenant("t1"), &JobFilter::new().with_status(JobStatus::Success))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_effective_limit() {
        assert_eq!(JobFilter::new().effective_limit(), DEFAULT_LIST_LIMIT);
        assert_eq!(JobFilter::new().with_limit(10_000).effective_limit(), MAX_LIST_LIMIT);
        assert_eq!(JobFilter::new().with_limit(0).effective_limit(), 1);
    }

    #[tokio::test]
    async fn test_stale_running_and_counts() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut stuck = job("t1", "a");
        stuck.mark_running(now - Duration::hours(8)).unwrap();
        let mut fresh = job("t1", "b");
        fresh.mark_running(now).unwrap();
        store.insert_if_no_active(stuck.clone()).await.unwrap();
        store.insert_if_no_active(fresh).await.unwrap();
        store.insert_if_no_active(job("t1", "c")).await.unwrap();

        let stale = store
            .list_stale_running(now - Duration::hours(6), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, stuck.id);

        let counts = store.count_by_status(&tenant("t1")).await.unwrap();
        assert_eq!(counts[&JobStatus::Running], 2);
        assert_eq!(counts[&JobStatus::Queued], 1);
        assert_eq!(counts[&JobStatus::DeadLetter], 0);
    }
}
