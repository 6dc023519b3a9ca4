//! CLI subcommand implementations.

pub mod dlq;
pub mod jobs;
pub mod migrate;

use serde::Serialize;
use tabled::Tabled;

use ingest_core::jobs::IngestionJob;

use crate::output;

/// One job as a table row.
#[derive(Debug, Serialize, Tabled)]
pub struct JobRow {
    #[tabled(rename = "ID")]
    pub id: String,
    #[tabled(rename = "Connector")]
    pub connector: String,
    #[tabled(rename = "Status")]
    #[serde(skip)]
    pub status_display: String,
    #[tabled(skip)]
    pub status: String,
    #[tabled(rename = "Retries")]
    pub retries: u32,
    #[tabled(rename = "Error")]
    pub error: String,
    #[tabled(rename = "Created")]
    pub created_at: String,
}

impl From<&IngestionJob> for JobRow {
    fn from(job: &IngestionJob) -> Self {
        Self {
            id: job.id.to_string(),
            connector: job.connector_id.to_string(),
            status_display: output::colored_status(job.status),
            status: job.status.as_str().to_string(),
            retries: job.retry_count,
            error: job
                .error_category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            created_at: output::format_time(Some(job.created_at)),
        }
    }
}

/// Full detail view of a job for table output.
pub fn print_job_detail(title: &str, job: &IngestionJob) {
    output::print_header(title);
    output::print_detail("ID", &job.id.to_string());
    output::print_detail("Tenant", job.tenant_id.as_str());
    output::print_detail("Connector", job.connector_id.as_str());
    output::print_detail("Connection", &job.external_connection_id);
    output::print_detail("Status", &output::colored_status(job.status));
    output::print_detail("Retries", &job.retry_count.to_string());
    output::print_detail("Requeues", &job.requeue_count.to_string());
    output::print_detail("Next Retry", &output::format_time(job.next_retry_at));
    output::print_detail(
        "External Job",
        job.external_job_id.as_deref().unwrap_or("-"),
    );
    if let Some(category) = job.error_category {
        output::print_detail("Error Category", category.as_str());
    }
    if let Some(message) = &job.error_message {
        output::print_detail("Error", message);
    }
    if let Some(rows) = job.records_synced {
        output::print_detail("Records", &rows.to_string());
    }
    if let Some(bytes) = job.bytes_synced {
        output::print_detail("Bytes", &bytes.to_string());
    }
    output::print_detail("Created", &output::format_time(Some(job.created_at)));
    output::print_detail("Started", &output::format_time(job.started_at));
    output::print_detail("Completed", &output::format_time(job.completed_at));
}
