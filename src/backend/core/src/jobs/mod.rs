//! Ingestion job orchestration.
//!
//! This module provides the tenant-isolated job queue:
//!
//! - **Job**: job record, identifiers and the status state machine
//! - **Store**: persistence seam with an in-memory implementation
//! - **Dispatcher**: one active job per (tenant, connector), DLQ requeue and cancel
//! - **Runner**: claims jobs and drives external syncs with per-tenant isolation
//! - **Retry**: failure classification and backoff decisions
//! - **Scheduler**: interval-based dispatch of connector syncs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Ingestion Job Orchestration                          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  Scheduler  │───▶│ Dispatcher  │───▶│  JobStore   │◀──▶│   Runner    │  │
//! │  │ (interval)  │    │ (one active │    │ (Postgres / │    │ (claim,     │  │
//! │  │             │    │  per conn.) │    │  in-memory) │    │  poll)      │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └──────┬──────┘  │
//! │                                                                  │         │
//! │                            ┌─────────────┐    ┌──────────────────▼──────┐  │
//! │                            │    Retry    │◀───│  RateLimitedSyncClient  │  │
//! │                            │ (classify,  │    │  (Airbyte API)          │  │
//! │                            │  backoff)   │    └─────────────────────────┘  │
//! │                            └─────────────┘                                 │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! queued ──▶ running ──▶ success
//!   ▲           │  ▲
//!   │           ▼  │
//!   │         failed (next_retry_at)
//!   │           │
//!   │           ▼
//!   └──── dead_letter          (any non-terminal) ──▶ cancelled
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ingest_core::jobs::{
//!     DispatchRequest, InMemoryJobStore, JobDispatcher, JobRunner, RetryPolicy, RunnerConfig,
//! };
//!
//! let store = Arc::new(InMemoryJobStore::new());
//! let dispatcher = JobDispatcher::new(store.clone());
//! dispatcher
//!     .dispatch(DispatchRequest::new(tenant_id, connector_id, "airbyte-connection-id"))
//!     .await?;
//!
//! let runner = Arc::new(JobRunner::new(store, sync_client, RetryPolicy::default(), RunnerConfig::default()));
//! let handle = runner.start();
//! // ...
//! handle.shutdown().await;
//! ```

pub mod dispatcher;
pub mod job;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;

pub use dispatcher::{
    AllowAllEntitlements, DispatchOutcome, DispatchRequest, EntitlementGate, JobDispatcher,
    StaticEntitlements,
};
pub use job::{ConnectorId, IngestionJob, JobId, JobStatus, TenantId};
pub use retry::{
    classify, BackoffStrategy, ErrorCategory, RetryAction, RetryDecision, RetryPolicy,
};
pub use runner::{JobOutcome, JobRunner, RunnerConfig, RunnerHandle, RunnerStats};
pub use scheduler::{ScheduleConfig, ScheduleId, ScheduledSync, SyncScheduler};
pub use store::{
    InMemoryJobStore, InsertOutcome, JobFilter, JobStore, UpdateOutcome, DEFAULT_LIST_LIMIT,
    MAX_LIST_LIMIT,
};
