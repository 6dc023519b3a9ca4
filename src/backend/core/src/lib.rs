#![allow(clippy::result_large_err)]
//! # Ingest Core
//!
//! Tenant-isolated orchestration of ELT ingestion jobs.
//!
//! ## Architecture
//!
//! - **Dispatcher**: one active job per (tenant, connector), entitlement gate, DLQ requeue and cancel
//! - **Runner**: claims runnable jobs, triggers and polls external syncs, bounded per tenant
//! - **Retry**: classifies failures and computes exponential backoff or dead-letters
//! - **Sync**: Airbyte API client behind account and connection rate limits
//! - **Store**: PostgreSQL job table with `SKIP LOCKED` claiming, plus an in-memory store
//! - **Observability**: structured logging, OTLP tracing and Prometheus metrics

pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod observability;
pub mod sync;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, IngestError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::db::{Database, PostgresJobStore};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, IngestError, Result};
    pub use crate::jobs::{
        ConnectorId, DispatchOutcome, DispatchRequest, EntitlementGate, ErrorCategory,
        InMemoryJobStore, IngestionJob, JobDispatcher, JobFilter, JobId, JobOutcome, JobRunner,
        JobStatus, JobStore, RetryPolicy, RunnerConfig, SyncScheduler, TenantId,
    };
    pub use crate::sync::{
        AirbyteClient, AirbyteConfig, ExternalJobStatus, RateLimitConfig, RateLimitedSyncClient,
        RateLimiter, SyncApi, SyncError,
    };
}
