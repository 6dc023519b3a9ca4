//! Schema migration command.

use anyhow::Result;

use crate::context::Context;
use crate::output::{self, OutputFormat};

pub async fn execute(ctx: &Context, format: OutputFormat) -> Result<()> {
    ctx.db.migrate().await?;

    match format {
        OutputFormat::Table => output::print_success("Migrations applied"),
        _ => output::print_item(&serde_json::json!({ "migrated": true }), format)?,
    }

    Ok(())
}
