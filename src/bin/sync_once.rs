use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use productive_sync::config;
use productive_sync::db;
use productive_sync::jsonapi::ApiClient;
use productive_sync::model::RunStatus;
use productive_sync::sync::{Syncer, TriggerError};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one full sync into the local database and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sync only these kinds (repeatable); defaults to `sync.kinds` or everything
    #[arg(long = "kind")]
    kinds: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = config::load(Some(&args.config))?;
    if !args.kinds.is_empty() {
        cfg.sync.kinds = args.kinds.clone();
        config::validate(&cfg)?;
    }
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let client = ApiClient::from_config(&cfg)?;
    let syncer = Syncer::new(Arc::new(client), pool, cfg.sync.clone());
    syncer.hydrate().await?;

    info!(kinds = syncer.kinds().len(), "starting one-shot sync");
    let summary = match syncer.trigger().await {
        Ok(summary) => summary,
        Err(TriggerError::AlreadyRunning { since }) => {
            error!(%since, "sync already running");
            return Ok(ExitCode::from(2));
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    match summary.status {
        RunStatus::Failed => {
            error!(message = %summary.message, "sync failed");
            Ok(ExitCode::FAILURE)
        }
        RunStatus::PartiallyFailed => {
            warn!(message = %summary.message, "sync finished with errors");
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            info!(secs = summary.execution_time, "sync finished");
            Ok(ExitCode::SUCCESS)
        }
    }
}
