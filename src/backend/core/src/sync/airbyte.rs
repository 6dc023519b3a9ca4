//! HTTP client for the Airbyte public API.
//!
//! Only the job endpoints are used:
//!
//! - `POST   {base}/jobs`        trigger a sync for a connection
//! - `GET    {base}/jobs/{id}`   poll a job
//! - `DELETE {base}/jobs/{id}`   cancel a job

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{ExternalJobStatus, SyncApi, SyncError, SyncJobRef, SyncJobStatus};

/// Connection settings for the Airbyte API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirbyteConfig {
    /// API root, e.g. `https://api.airbyte.com/v1`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token for the workspace
    #[serde(default)]
    pub api_token: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for AirbyteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.airbyte.com/v1".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

// ── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobRequest<'a> {
    connection_id: &'a str,
    job_type: &'static str,
}

/// Airbyte returns numeric job ids; self-hosted proxies sometimes stringify them.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobIdRepr {
    Number(i64),
    Text(String),
}

impl JobIdRepr {
    fn into_string(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    job_id: JobIdRepr,
    status: ExternalJobStatus,
    #[serde(default)]
    rows_synced: Option<u64>,
    #[serde(default)]
    bytes_synced: Option<u64>,
}

/// Airbyte API client.
#[derive(Debug, Clone)]
pub struct AirbyteClient {
    client: Client,
    base_url: String,
    api_token: String,
}

impl AirbyteClient {
    /// Build a client from configuration.
    pub fn new(config: &AirbyteConfig) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode(&self, resp: reqwest::Response) -> Result<JobResponse, SyncError> {
        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers(), Utc::now());
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, retry_after, body));
        }

        resp.json::<JobResponse>()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SyncApi for AirbyteClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn trigger_sync(&self, connection_id: &str) -> Result<SyncJobRef, SyncError> {
        let resp = self
            .client
            .post(self.url("/jobs"))
            .bearer_auth(&self.api_token)
            .json(&CreateJobRequest {
                connection_id,
                job_type: "sync",
            })
            .send()
            .await
            .map_err(transport_error)?;

        let job = self.decode(resp).await?;
        let external_job_id = job.job_id.into_string();
        debug!(%external_job_id, status = %job.status, "Sync triggered");

        Ok(SyncJobRef {
            external_job_id,
            status: job.status,
        })
    }

    #[instrument(skip(self))]
    async fn job_status(&self, external_job_id: &str) -> Result<SyncJobStatus, SyncError> {
        let resp = self
            .client
            .get(self.url(&format!("/jobs/{}", external_job_id)))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;

        let job = self.decode(resp).await?;
        let message = match job.status {
            ExternalJobStatus::Failed | ExternalJobStatus::Incomplete => Some(format!(
                "sync job {} finished with status {}",
                external_job_id, job.status
            )),
            _ => None,
        };

        Ok(SyncJobStatus {
            external_job_id: job.job_id.into_string(),
            status: job.status,
            rows_synced: job.rows_synced,
            bytes_synced: job.bytes_synced,
            message,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_job(&self, external_job_id: &str) -> Result<(), SyncError> {
        let resp = self
            .client
            .delete(self.url(&format!("/jobs/{}", external_job_id)))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(transport_error)?;

        match self.decode(resp).await {
            Ok(job) => {
                debug!(status = %job.status, "Sync cancel requested");
                Ok(())
            }
            // Already finished or gone: nothing left to cancel.
            Err(SyncError::NotFound(_)) | Err(SyncError::Conflict(_)) => {
                warn!("Sync job not cancellable, treating as already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn transport_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() {
        SyncError::Timeout(error.to_string())
    } else if error.is_connect() {
        SyncError::Connection(error.to_string())
    } else if error.is_decode() {
        SyncError::Decode(error.to_string())
    } else {
        SyncError::Other(error.to_string())
    }
}

/// Map a non-success HTTP status to a sync error.
pub(crate) fn error_for_status(status: StatusCode, retry_after: Option<Duration>, body: String) -> SyncError {
    let code = status.as_u16();
    match code {
        429 => SyncError::RateLimited { retry_after },
        401 | 403 => SyncError::Unauthorized(body),
        404 => SyncError::NotFound(body),
        408 | 504 => SyncError::Timeout(format!("HTTP {}: {}", code, body)),
        409 => SyncError::Conflict(body),
        500..=599 => SyncError::Server {
            status: code,
            message: body,
        },
        _ => SyncError::BadRequest {
            status: code,
            message: body,
        },
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok()
}
