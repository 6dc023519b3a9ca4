//! Job management commands.
//!
//! Provides list, show, dispatch, cancel, and stats operations for a tenant's
//! ingestion jobs.

use anyhow::{Context as _, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use ingest_core::jobs::{
    ConnectorId, DispatchOutcome, DispatchRequest, JobFilter, JobId, JobStatus, TenantId,
};

use super::{print_job_detail, JobRow};
use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List a tenant's jobs, newest first
    List {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Filter by status (queued, running, failed, dead_letter, success, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by connector
        #[arg(long)]
        connector: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show one job
    Show {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Job ID
        job_id: String,
    },

    /// Queue an ingestion run for a connector
    Dispatch {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Connector ID
        #[arg(long)]
        connector: String,

        /// External connection ID on the sync platform
        #[arg(long)]
        connection: String,

        /// Job metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Cancel a job
    Cancel {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Job ID
        job_id: String,
    },

    /// Job counts per status
    Stats {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,
    },
}

#[derive(Debug, Serialize, Tabled)]
struct StatusCountRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Jobs")]
    count: u64,
}

pub async fn execute(cmd: JobsCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        JobsCommands::List {
            tenant,
            status,
            connector,
            limit,
        } => {
            let tenant = TenantId::new(&tenant)?;
            let mut filter = JobFilter::new().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status.parse::<JobStatus>()?);
            }
            if let Some(connector) = connector {
                filter = filter.with_connector(ConnectorId::new(&connector)?);
            }

            let jobs = ctx.dispatcher.list_jobs(&tenant, &filter).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)?;
        }

        JobsCommands::Show { tenant, job_id } => {
            let tenant = TenantId::new(&tenant)?;
            let id: JobId = job_id.parse()?;
            let job = ctx.dispatcher.get_job(&tenant, id).await?;

            match format {
                OutputFormat::Table => print_job_detail(&format!("Job: {}", job.id), &job),
                _ => output::print_item(&job, format)?,
            }
        }

        JobsCommands::Dispatch {
            tenant,
            connector,
            connection,
            metadata,
        } => {
            let mut request = DispatchRequest::new(
                TenantId::new(&tenant)?,
                ConnectorId::new(&connector)?,
                connection,
            );
            if let Some(raw) = metadata {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).context("Metadata must be valid JSON")?;
                request = request.with_metadata(value);
            }

            let outcome = ctx.dispatcher.dispatch(request).await?;
            match format {
                OutputFormat::Table => {
                    match &outcome {
                        DispatchOutcome::Created(_) => output::print_success("Job queued"),
                        DispatchOutcome::AlreadyActive(_) => {
                            output::print_info("Connector already has an active job")
                        }
                    }
                    let job = outcome.job();
                    output::print_detail("ID", &job.id.to_string());
                    output::print_detail("Status", &output::colored_status(job.status));
                }
                _ => output::print_item(outcome.job(), format)?,
            }
        }

        JobsCommands::Cancel { tenant, job_id } => {
            let tenant = TenantId::new(&tenant)?;
            let id: JobId = job_id.parse()?;
            let job = ctx.dispatcher.cancel(&tenant, id).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} cancelled", job.id));
                }
                _ => output::print_item(&job, format)?,
            }
        }

        JobsCommands::Stats { tenant } => {
            let tenant = TenantId::new(&tenant)?;
            let counts = ctx.dispatcher.store().count_by_status(&tenant).await?;
            let rows: Vec<StatusCountRow> = JobStatus::ALL
                .iter()
                .map(|status| StatusCountRow {
                    status: status.as_str().to_string(),
                    count: counts.get(status).copied().unwrap_or(0),
                })
                .collect();
            output::print_list(&rows, format)?;
        }
    }

    Ok(())
}
