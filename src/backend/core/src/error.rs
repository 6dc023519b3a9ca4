//! Error handling for the ingestion core.
//!
//! This module provides:
//! - A single error type with stable machine-readable codes
//! - User-facing vs internal messages
//! - Error chaining with `source`
//! - Severity-based logging with tracing
//! - An `ingest_errors_total` counter for every constructed error
//!
//! # Usage
//!
//! ```rust,ignore
//! use ingest_core::error::{IngestError, Result, ErrorContext, ErrorCode};
//!
//! fn load(tenant: &TenantId, id: JobId) -> Result<IngestionJob> {
//!     store_lookup(tenant, id)
//!         .context("job lookup failed")?
//!         .with_error_code(ErrorCode::JobNotFound)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::sync::SyncError;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are printed by the operator CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    ActiveJobExists,
    InvalidStateTransition,
    Conflict,
    EntitlementDenied,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    RecordNotFound,
    DuplicateRecord,

    // Cache Errors (2100-2199)
    CacheError,
    CacheConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Sync Errors (3000-3099)
    SyncApiError,
    SyncRateLimited,
    SyncTimeout,
    SyncUnavailable,
    SyncUnauthorized,
    NetworkError,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::ActiveJobExists => 1001,
            Self::InvalidStateTransition => 1002,
            Self::Conflict => 1003,
            Self::EntitlementDenied => 1004,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::CacheError => 2100,
            Self::CacheConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::SyncApiError => 3000,
            Self::SyncRateLimited => 3001,
            Self::SyncTimeout => 3002,
            Self::SyncUnavailable => 3003,
            Self::SyncUnauthorized => 3004,
            Self::NetworkError => 3005,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::CacheConnectionFailed
                | Self::CacheError
                | Self::Conflict
                | Self::SyncRateLimited
                | Self::SyncTimeout
                | Self::SyncUnavailable
                | Self::NetworkError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            2000..=2099 => "database",
            2100..=2199 => "cache",
            2200..=2299 => "serialization",
            3000..=3099 => "external_sync",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, missing jobs, refused transitions)
    Low,
    /// Operational issues (rate limits, timeouts, races)
    Medium,
    /// System errors (database failures, broken configuration)
    High,
    /// Critical errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::ActiveJobExists
            | ErrorCode::InvalidStateTransition
            | ErrorCode::EntitlementDenied
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput => Self::Low,

            ErrorCode::Conflict
            | ErrorCode::SyncRateLimited
            | ErrorCode::SyncTimeout
            | ErrorCode::SyncUnavailable => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::CacheError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::SyncApiError
            | ErrorCode::SyncUnauthorized
            | ErrorCode::NetworkError
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::CacheConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, tenant, connector)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the ingestion core.
#[derive(Error, Debug)]
pub struct IngestError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to show to operators and tenants)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl IngestError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an invalid input error for a named field.
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, format!("{}: {}", field, message.into()))
            .with_context("field", field)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "ingest_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| IngestError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| IngestError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| IngestError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| IngestError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Name of the partial unique index guarding one active job per connector.
pub(crate) const ONE_ACTIVE_INDEX: &str = "ingestion_jobs_one_active_idx";

impl From<sqlx::Error> for IngestError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if db_err.constraint() == Some(ONE_ACTIVE_INDEX) {
                    return Self::with_internal(
                        ErrorCode::ActiveJobExists,
                        "An active ingestion job already exists for this connector",
                        db_err.message().to_string(),
                    )
                    .with_source(error);
                }
                if db_err.is_unique_violation() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        db_err.message().to_string(),
                    )
                    .with_source(error);
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorCode::DeserializationError,
                "Stored record could not be decoded",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Database migration failed",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to cache")
        } else if error.is_timeout() {
            (ErrorCode::CacheError, "Cache operation timed out")
        } else {
            (ErrorCode::CacheError, "A cache error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<SyncError> for IngestError {
    fn from(error: SyncError) -> Self {
        let (code, user_msg) = match &error {
            SyncError::RateLimited { .. } => {
                (ErrorCode::SyncRateLimited, "Rate limited by the sync platform")
            }
            SyncError::Timeout(_) => (ErrorCode::SyncTimeout, "Sync platform request timed out"),
            SyncError::Server { .. } | SyncError::Conflict(_) => (
                ErrorCode::SyncUnavailable,
                "Sync platform is temporarily unavailable",
            ),
            SyncError::Connection(_) => (
                ErrorCode::NetworkError,
                "Failed to connect to the sync platform",
            ),
            SyncError::Unauthorized(_) => (
                ErrorCode::SyncUnauthorized,
                "Sync platform rejected the credentials",
            ),
            _ => (ErrorCode::SyncApiError, "Sync platform returned an error"),
        };

        let retry_after = match &error {
            SyncError::RateLimited { retry_after: Some(d) } => Some(d.as_secs()),
            _ => None,
        };

        let mut converted = Self::with_internal(code, user_msg, error.to_string());
        if let Some(secs) = retry_after {
            converted.details.retry_after_secs = Some(secs);
        }
        converted.with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for IngestError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::SyncTimeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<std::io::Error> for IngestError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::SyncTimeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::NetworkError, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<IngestError>() {
            Ok(ingest_error) => ingest_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for IngestError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl IngestError {
    /// A job that does not exist, or belongs to another tenant.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Ingestion job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("ingestion_job", id))
    }

    pub fn active_job_exists(connector_id: impl fmt::Display, active_job: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ActiveJobExists,
            format!(
                "Connector {} already has an active ingestion job ({})",
                connector_id, active_job
            ),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("ingestion_job", active_job.to_string())
                .with_suggestion("Wait for the active job to finish or cancel it first"),
        )
    }

    pub fn invalid_state_transition(
        job_id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Job {} cannot move from {} to {}", job_id, from, to),
        )
        .with_context("from", from.to_string())
        .with_context("to", to.to_string())
    }

    pub fn conflict(job_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Conflict,
            format!("Job {} was modified concurrently", job_id),
        )
        .with_details(ErrorDetails::new().with_suggestion("Reload the job and retry"))
    }

    pub fn entitlement_denied(tenant_id: impl fmt::Display, connector_id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntitlementDenied,
            format!(
                "Tenant {} is not entitled to ingest connector {}",
                tenant_id, connector_id
            ),
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message.into())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::SyncRateLimited.is_retryable());
        assert!(ErrorCode::DatabaseConnectionFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::JobNotFound.is_retryable());
        assert!(!ErrorCode::ActiveJobExists.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::ActiveJobExists.category(), "job");
        assert_eq!(ErrorCode::SyncTimeout.category(), "external_sync");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
    }

    #[test]
    fn test_job_not_found_details() {
        let error = IngestError::job_not_found("8d1c");
        assert_eq!(error.code(), ErrorCode::JobNotFound);
        assert_eq!(error.details().entity_type.as_deref(), Some("ingestion_job"));
        assert_eq!(error.details().entity_id.as_deref(), Some("8d1c"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_context() {
        let error = IngestError::new(ErrorCode::ValidationError, "Invalid input")
            .with_context("field", "connector_id")
            .with_context("reason", "empty");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_from_sync_error_keeps_retry_after() {
        let error: IngestError = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(42)),
        }
        .into();
        assert_eq!(error.code(), ErrorCode::SyncRateLimited);
        assert_eq!(error.details().retry_after_secs, Some(42));

        let error: IngestError = SyncError::Unauthorized("bad token".into()).into();
        assert_eq!(error.code(), ErrorCode::SyncUnauthorized);
    }

    #[test]
    fn test_from_row_not_found() {
        let error: IngestError = sqlx::Error::RowNotFound.into();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::InvalidStateTransition),
            ErrorSeverity::Low
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::SyncRateLimited),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseError),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DatabaseConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = IngestError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Database connection failed"));
        assert!(display.contains("Connection refused"));
    }
}
