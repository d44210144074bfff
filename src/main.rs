use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use productive_sync::config;
use productive_sync::db;
use productive_sync::jsonapi::ApiClient;
use productive_sync::server::{self, AppState};
use productive_sync::sync::Syncer;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override `server.bind`
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let client = ApiClient::from_config(&cfg)?;
    let syncer = Syncer::new(Arc::new(client), pool, cfg.sync.clone());
    syncer.hydrate().await?;

    let bind = args.bind.unwrap_or_else(|| cfg.server.bind.clone());
    info!(kinds = syncer.kinds().len(), "starting sync service");
    server::serve(
        &bind,
        AppState {
            syncer: Arc::new(syncer),
        },
    )
    .await
}
