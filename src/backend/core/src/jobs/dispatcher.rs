//! Job dispatcher: the tenant-facing entry point for ingestion jobs.
//!
//! Enforces one active job per (tenant, connector), gates creation on
//! entitlements and handles dead letter queue requeue and cancellation.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::jobs::job::{ConnectorId, IngestionJob, JobId, JobStatus, TenantId};
use crate::jobs::store::{InsertOutcome, JobFilter, JobStore, UpdateOutcome};
use crate::sync::SyncApi;

// ═══════════════════════════════════════════════════════════════════════════════
// Entitlements
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides whether a tenant's plan allows ingesting a connector.
#[async_trait]
pub trait EntitlementGate: Send + Sync {
    async fn can_ingest(&self, tenant_id: &TenantId, connector_id: &ConnectorId) -> Result<bool>;
}

/// Gate that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllEntitlements;

#[async_trait]
impl EntitlementGate for AllowAllEntitlements {
    async fn can_ingest(&self, _tenant_id: &TenantId, _connector_id: &ConnectorId) -> Result<bool> {
        Ok(true)
    }
}

/// Deny-list gate: blocked tenants, or specific (tenant, connector) pairs.
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    denied_tenants: HashSet<TenantId>,
    denied_connectors: HashSet<(TenantId, ConnectorId)>,
}

impl StaticEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_tenant(mut self, tenant_id: TenantId) -> Self {
        self.denied_tenants.insert(tenant_id);
        self
    }

    pub fn deny_connector(mut self, tenant_id: TenantId, connector_id: ConnectorId) -> Self {
        self.denied_connectors.insert((tenant_id, connector_id));
        self
    }
}

#[async_trait]
impl EntitlementGate for StaticEntitlements {
    async fn can_ingest(&self, tenant_id: &TenantId, connector_id: &ConnectorId) -> Result<bool> {
        if self.denied_tenants.contains(tenant_id) {
            return Ok(false);
        }
        Ok(!self
            .denied_connectors
            .contains(&(tenant_id.clone(), connector_id.clone())))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Request to start ingesting a connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub tenant_id: TenantId,
    pub connector_id: ConnectorId,
    pub external_connection_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl DispatchRequest {
    pub fn new(
        tenant_id: TenantId,
        connector_id: ConnectorId,
        external_connection_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            connector_id,
            external_connection_id: external_connection_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of [`JobDispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Created(IngestionJob),
    /// The connector already had an active job, which is returned unchanged.
    AlreadyActive(IngestionJob),
}

impl DispatchOutcome {
    pub fn job(&self) -> &IngestionJob {
        match self {
            Self::Created(job) | Self::AlreadyActive(job) => job,
        }
    }

    pub fn into_job(self) -> IngestionJob {
        match self {
            Self::Created(job) | Self::AlreadyActive(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Creates, requeues and cancels ingestion jobs.
pub struct JobDispatcher {
    store: Arc<dyn JobStore>,
    entitlements: Arc<dyn EntitlementGate>,
    sync: Option<Arc<dyn SyncApi>>,
}

impl JobDispatcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            entitlements: Arc::new(AllowAllEntitlements),
            sync: None,
        }
    }

    pub fn with_entitlements(mut self, entitlements: Arc<dyn EntitlementGate>) -> Self {
        self.entitlements = entitlements;
        self
    }

    /// Sync client used to cancel running external syncs.
    pub fn with_sync_api(mut self, sync: Arc<dyn SyncApi>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queue a job for the connector, or return the one already active.
    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, connector_id = %request.connector_id))]
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let connection = request.external_connection_id.trim();
        if connection.is_empty() {
            return Err(IngestError::invalid_input(
                "external_connection_id",
                "must not be empty",
            ));
        }

        if !self
            .entitlements
            .can_ingest(&request.tenant_id, &request.connector_id)
            .await?
        {
            counter!("ingest_dispatch_total", "outcome" => "denied").increment(1);
            return Err(IngestError::entitlement_denied(
                &request.tenant_id,
                &request.connector_id,
            ));
        }

        let job = IngestionJob::new(request.tenant_id, request.connector_id, connection)
            .with_metadata(request.metadata);

        match self.store.insert_if_no_active(job).await? {
            InsertOutcome::Inserted(job) => {
                counter!("ingest_dispatch_total", "outcome" => "created").increment(1);
                info!(job_id = %job.id, "Ingestion job queued");
                Ok(DispatchOutcome::Created(job))
            }
            InsertOutcome::ActiveExists(existing) => {
                counter!("ingest_dispatch_total", "outcome" => "already_active").increment(1);
                info!(job_id = %existing.id, status = %existing.status, "Connector already has an active job");
                Ok(DispatchOutcome::AlreadyActive(existing))
            }
        }
    }

    /// Fetch a tenant's job.
    pub async fn get_job(&self, tenant_id: &TenantId, id: JobId) -> Result<IngestionJob> {
        self.store
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| IngestError::job_not_found(id))
    }

    pub async fn active_job(
        &self,
        tenant_id: &TenantId,
        connector_id: &ConnectorId,
    ) -> Result<Option<IngestionJob>> {
        self.store.find_active(tenant_id, connector_id).await
    }

    pub async fn list_jobs(&self, tenant_id: &TenantId, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        self.store.list(tenant_id, filter).await
    }

    /// Jobs waiting in the dead letter queue.
    pub async fn dead_letter_jobs(
        &self,
        tenant_id: &TenantId,
        limit: Option<u32>,
    ) -> Result<Vec<IngestionJob>> {
        let filter = JobFilter {
            status: Some(JobStatus::DeadLetter),
            connector_id: None,
            limit,
        };
        self.store.list(tenant_id, &filter).await
    }

    /// Move a dead-lettered job back to the queue with a fresh retry budget.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %id))]
    pub async fn requeue(&self, tenant_id: &TenantId, id: JobId) -> Result<IngestionJob> {
        let mut job = self.get_job(tenant_id, id).await?;
        let expected = job.status;
        job.requeue(Utc::now())?;

        // ActiveJobExists from the store propagates as is.
        match self.store.update(&job, expected).await? {
            UpdateOutcome::Applied => {
                counter!("ingest_dlq_requeued_total").increment(1);
                info!(requeue_count = job.requeue_count, "Job requeued from dead letter queue");
                Ok(job)
            }
            UpdateOutcome::StatusChanged(current) => Err(IngestError::invalid_state_transition(
                id,
                current.status,
                JobStatus::Queued,
            )),
        }
    }

    /// Cancel a job only while it sits in the dead letter queue.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %id))]
    pub async fn discard_dead_letter(&self, tenant_id: &TenantId, id: JobId) -> Result<IngestionJob> {
        let mut job = self.get_job(tenant_id, id).await?;
        if job.status != JobStatus::DeadLetter {
            return Err(IngestError::invalid_state_transition(
                id,
                job.status,
                JobStatus::Cancelled,
            ));
        }
        job.mark_cancelled(Utc::now())?;

        match self.store.update(&job, JobStatus::DeadLetter).await? {
            UpdateOutcome::Applied => {
                counter!("ingest_jobs_cancelled_total", "source" => "dlq").increment(1);
                info!("Dead-lettered job cancelled");
                Ok(job)
            }
            UpdateOutcome::StatusChanged(current) => Err(IngestError::invalid_state_transition(
                id,
                current.status,
                JobStatus::Cancelled,
            )),
        }
    }

    /// Cancel a job that has not finished yet.
    ///
    /// A running job's external sync is cancelled best-effort.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %id))]
    pub async fn cancel(&self, tenant_id: &TenantId, id: JobId) -> Result<IngestionJob> {
        let mut job = self.get_job(tenant_id, id).await?;

        for attempt in 0..2 {
            let expected = job.status;
            let external = (expected == JobStatus::Running)
                .then(|| job.external_job_id.clone())
                .flatten();

            job.mark_cancelled(Utc::now())?;

            match self.store.update(&job, expected).await? {
                UpdateOutcome::Applied => {
                    if let Some(external_job_id) = external {
                        self.cancel_external(&external_job_id).await;
                    }
                    counter!("ingest_jobs_cancelled_total", "source" => "operator").increment(1);
                    info!(from = %expected, "Job cancelled");
                    return Ok(job);
                }
                UpdateOutcome::StatusChanged(current) if attempt == 0 => {
                    warn!(from = %expected, now = %current.status, "Job changed during cancel, retrying");
                    job = current;
                }
                UpdateOutcome::StatusChanged(_) => break,
            }
        }

        Err(IngestError::conflict(id))
    }

    async fn cancel_external(&self, external_job_id: &str) {
        let Some(sync) = self.sync.as_ref() else {
            return;
        };
        if let Err(e) = sync.cancel_job(external_job_id).await {
            warn!(external_job_id, error = %e, "External sync cancel failed");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
