//! Shared state for commands: configuration, database and dispatcher.

use anyhow::{Context as _, Result};
use std::sync::Arc;

use ingest_core::config::Config;
use ingest_core::db::Database;
use ingest_core::jobs::{JobDispatcher, JobStore};
use ingest_core::sync::{AirbyteClient, RateLimitedSyncClient, RateLimiter, SyncApi};

pub struct Context {
    pub db: Database,
    pub dispatcher: JobDispatcher,
}

impl Context {
    pub async fn connect(config_path: Option<&str>, database_url: Option<String>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load config file: {}", path))?,
            None => Config::load().context("Failed to load configuration")?,
        };
        if let Some(url) = database_url {
            config.database.url = url;
        }

        let db = Database::connect(&config.database)
            .await
            .context("Failed to connect to the job database")?;
        let store: Arc<dyn JobStore> = Arc::new(db.job_store());

        let mut dispatcher = JobDispatcher::new(store);

        // Without a token, running jobs are cancelled locally and the
        // worker stops polling them on its next check.
        if !config.airbyte.api_token.trim().is_empty() {
            let limiter = Arc::new(RateLimiter::in_memory(config.rate_limit_config()));
            let client = AirbyteClient::new(&config.airbyte)?;
            let sync: Arc<dyn SyncApi> = Arc::new(RateLimitedSyncClient::new(client, limiter));
            dispatcher = dispatcher.with_sync_api(sync);
        }

        Ok(Self { db, dispatcher })
    }
}
