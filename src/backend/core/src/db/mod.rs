//! Database layer.
//!
//! Uses PostgreSQL for persistent storage with sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool};
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, IngestError, Result};
use crate::jobs::job::{ConnectorId, IngestionJob, JobId, JobStatus, TenantId};
use crate::jobs::store::{InsertOutcome, JobFilter, JobStore, UpdateOutcome};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Job store backed by this pool.
    pub fn job_store(&self) -> PostgresJobStore {
        PostgresJobStore::new(self.pool.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Row Types
// ═══════════════════════════════════════════════════════════════════════════════

const JOB_COLUMNS: &str = "id, tenant_id, connector_id, external_connection_id, status, \
    retry_count, requeue_count, next_retry_at, external_job_id, error_message, error_category, \
    records_synced, bytes_synced, metadata, created_at, updated_at, started_at, completed_at";

const ACTIVE_STATUSES: &str = "('queued', 'running', 'failed')";

#[derive(Debug, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub connector_id: String,
    pub external_connection_id: String,
    pub status: String,
    pub retry_count: i32,
    pub requeue_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub external_job_id: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub records_synced: Option<i64>,
    pub bytes_synced: Option<i64>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn corrupt(column: &str, job_id: Uuid, error: IngestError) -> IngestError {
    IngestError::with_internal(
        ErrorCode::DeserializationError,
        "Stored ingestion job could not be decoded",
        format!("job {} column {}: {}", job_id, column, error),
    )
}

impl TryFrom<JobRow> for IngestionJob {
    type Error = IngestError;

    fn try_from(row: JobRow) -> Result<Self> {
        let id = row.id;
        Ok(Self {
            id: JobId(id),
            tenant_id: TenantId::new(&row.tenant_id).map_err(|e| corrupt("tenant_id", id, e))?,
            connector_id: ConnectorId::new(&row.connector_id)
                .map_err(|e| corrupt("connector_id", id, e))?,
            external_connection_id: row.external_connection_id,
            status: row.status.parse().map_err(|e| corrupt("status", id, e))?,
            retry_count: row.retry_count.max(0) as u32,
            requeue_count: row.requeue_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            external_job_id: row.external_job_id,
            error_message: row.error_message,
            error_category: row
                .error_category
                .map(|c| c.parse())
                .transpose()
                .map_err(|e| corrupt("error_category", id, e))?,
            records_synced: row.records_synced.map(|n| n.max(0) as u64),
            bytes_synced: row.bytes_synced.map(|n| n.max(0) as u64),
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn to_i64(n: Option<u64>) -> Option<i64> {
    n.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Postgres Job Store
// ═══════════════════════════════════════════════════════════════════════════════

/// [`JobStore`] on the `ingestion_jobs` table.
///
/// The one-active-job rule is enforced by the partial unique index
/// `ingestion_jobs_one_active_idx`; violations surface as `ActiveJobExists`.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_id<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<IngestionJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM ingestion_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(executor)
        .await?;

        row.map(IngestionJob::try_from).transpose()
    }

    /// Compare-and-set write of every mutable column; returns rows affected.
    async fn write<'e, E: PgExecutor<'e>>(
        executor: E,
        job: &IngestionJob,
        expected: JobStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = $4,
                retry_count = $5,
                requeue_count = $6,
                next_retry_at = $7,
                external_job_id = $8,
                error_message = $9,
                error_category = $10,
                records_synced = $11,
                bytes_synced = $12,
                metadata = $13,
                updated_at = $14,
                started_at = $15,
                completed_at = $16
            WHERE id = $1 AND tenant_id = $2 AND status = $3
            "#,
        )
        .bind(job.id.0)
        .bind(job.tenant_id.as_str())
        .bind(expected.as_str())
        .bind(job.status.as_str())
        .bind(job.retry_count as i32)
        .bind(job.requeue_count as i32)
        .bind(job.next_retry_at)
        .bind(job.external_job_id.as_deref())
        .bind(job.error_message.as_deref())
        .bind(job.error_category.map(|c| c.as_str()))
        .bind(to_i64(job.records_synced))
        .bind(to_i64(job.bytes_synced))
        .bind(&job.metadata)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, tenant_id = %job.tenant_id, connector_id = %job.connector_id))]
    async fn insert_if_no_active(&self, job: IngestionJob) -> Result<InsertOutcome> {
        // The active row can finish between the conflicting insert and the
        // lookup; retry a few times before giving up.
        for _ in 0..3 {
            let inserted = sqlx::query_as::<_, JobRow>(&format!(
                r#"
                INSERT INTO ingestion_jobs ({cols})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (tenant_id, connector_id) WHERE status IN {active} DO NOTHING
                RETURNING {cols}
                "#,
                cols = JOB_COLUMNS,
                active = ACTIVE_STATUSES,
            ))
            .bind(job.id.0)
            .bind(job.tenant_id.as_str())
            .bind(job.connector_id.as_str())
            .bind(&job.external_connection_id)
            .bind(job.status.as_str())
            .bind(job.retry_count as i32)
            .bind(job.requeue_count as i32)
            .bind(job.next_retry_at)
            .bind(job.external_job_id.as_deref())
            .bind(job.error_message.as_deref())
            .bind(job.error_category.map(|c| c.as_str()))
            .bind(to_i64(job.records_synced))
            .bind(to_i64(job.bytes_synced))
            .bind(&job.metadata)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = inserted {
                return Ok(InsertOutcome::Inserted(row.try_into()?));
            }

            if let Some(existing) = self.find_active(&job.tenant_id, &job.connector_id).await? {
                return Ok(InsertOutcome::ActiveExists(existing));
            }
            debug!("Active job finished during insert, retrying");
        }

        Err(IngestError::conflict(job.id))
    }

    async fn get(&self, tenant_id: &TenantId, id: JobId) -> Result<Option<IngestionJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM ingestion_jobs WHERE id = $1 AND tenant_id = $2",
            JOB_COLUMNS
        ))
        .bind(id.0)
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(IngestionJob::try_from).transpose()
    }

    async fn find_active(
        &self,
        tenant_id: &TenantId,
        connector_id: &ConnectorId,
    ) -> Result<Option<IngestionJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM ingestion_jobs \
             WHERE tenant_id = $1 AND connector_id = $2 AND status IN {} \
             LIMIT 1",
            JOB_COLUMNS, ACTIVE_STATUSES
        ))
        .bind(tenant_id.as_str())
        .bind(connector_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(IngestionJob::try_from).transpose()
    }

    async fn list(&self, tenant_id: &TenantId, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM ingestion_jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR connector_id = $3)
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
            JOB_COLUMNS
        ))
        .bind(tenant_id.as_str())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.connector_id.as_ref().map(|c| c.as_str()))
        .bind(filter.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IngestionJob::try_from).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status, expected = %expected))]
    async fn update(&self, job: &IngestionJob, expected: JobStatus) -> Result<UpdateOutcome> {
        if Self::write(&self.pool, job, expected).await? == 1 {
            return Ok(UpdateOutcome::Applied);
        }

        match self.get(&job.tenant_id, job.id).await? {
            Some(current) => Ok(UpdateOutcome::StatusChanged(current)),
            None => Err(IngestError::job_not_found(job.id)),
        }
    }

    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        skip_tenants: &[TenantId],
    ) -> Result<Option<IngestionJob>> {
        let skip: Vec<String> = skip_tenants.iter().map(|t| t.as_str().to_string()).collect();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM ingestion_jobs
            WHERE (status = 'queued'
                   OR (status = 'failed' AND (next_retry_at IS NULL OR next_retry_at <= $1)))
              AND NOT (tenant_id = ANY($2))
            ORDER BY COALESCE(next_retry_at, created_at), created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
            JOB_COLUMNS
        ))
        .bind(now)
        .bind(&skip)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut job = IngestionJob::try_from(row)?;
        let expected = job.status;
        job.mark_running(now)?;

        if Self::write(&mut *tx, &job, expected).await? != 1 {
            tx.rollback().await?;
            return Ok(None);
        }
        tx.commit().await?;

        debug!(job_id = %job.id, tenant_id = %job.tenant_id, "Claimed job");
        Ok(Some(job))
    }

    async fn list_stale_running(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM ingestion_jobs
            WHERE status = 'running' AND (started_at IS NULL OR started_at < $1)
            ORDER BY started_at NULLS FIRST
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(started_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IngestionJob::try_from).collect()
    }

    async fn count_by_status(&self, tenant_id: &TenantId) -> Result<HashMap<JobStatus, u64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM ingestion_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts: HashMap<JobStatus, u64> =
            JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for (status, count) in rows {
            counts.insert(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }
}
