use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use tabsync::config;
use tabsync::connector::ConnectorRegistry;
use tabsync::db;
use tabsync::job;
use tabsync::store::SqliteWorkingStore;

#[derive(Debug, Parser)]
#[command(author, version, about = "Workbook sync daemon")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tabsync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteWorkingStore::new(pool.clone()));

    // Integrations register here; embedding applications add their own.
    let registry = ConnectorRegistry::new();
    if registry.is_empty() {
        warn!("no connectors registered; jobs for connector-bound folders will fail");
    }

    let poll = Duration::from_millis(cfg.app.poll_interval_ms);
    let workers = cfg.app.max_concurrent_jobs.max(1);
    info!(workers, workbook = %cfg.workbook.id, "starting sync workers");

    let mut handles = Vec::new();
    for _ in 0..workers {
        let pool = pool.clone();
        let store = store.clone();
        let registry = registry.clone();
        handles.push(tokio::spawn(job::run_worker(pool, store, registry, poll)));
    }
    for handle in handles {
        handle.await?;
    }

    Ok(())
}
