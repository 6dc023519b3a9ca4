//! Dead letter queue commands.

use anyhow::Result;
use clap::Subcommand;

use ingest_core::jobs::{JobId, TenantId};

use super::JobRow;
use crate::context::Context;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List dead-lettered jobs
    List {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Put a dead-lettered job back on the queue with a fresh retry budget
    Requeue {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Job ID
        job_id: String,
    },

    /// Cancel a dead-lettered job, closing it for good
    Cancel {
        /// Tenant ID
        #[arg(short, long)]
        tenant: String,

        /// Job ID
        job_id: String,
    },
}

pub async fn execute(cmd: DlqCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        DlqCommands::List { tenant, limit } => {
            let tenant = TenantId::new(&tenant)?;
            let jobs = ctx.dispatcher.dead_letter_jobs(&tenant, limit).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, format)?;
        }

        DlqCommands::Requeue { tenant, job_id } => {
            let tenant = TenantId::new(&tenant)?;
            let id: JobId = job_id.parse()?;
            let job = ctx.dispatcher.requeue(&tenant, id).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} requeued", job.id));
                    output::print_detail("Requeues", &job.requeue_count.to_string());
                }
                _ => output::print_item(&job, format)?,
            }
        }

        DlqCommands::Cancel { tenant, job_id } => {
            let tenant = TenantId::new(&tenant)?;
            let id: JobId = job_id.parse()?;
            let job = ctx.dispatcher.discard_dead_letter(&tenant, id).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Job {} cancelled", job.id));
                }
                _ => output::print_item(&job, format)?,
            }
        }
    }

    Ok(())
}
