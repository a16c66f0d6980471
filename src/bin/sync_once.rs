use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use tabsync::config;
use tabsync::connector::ConnectorRegistry;
use tabsync::db;
use tabsync::job;
use tabsync::store::SqliteWorkingStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run all pending sync jobs to a terminal state and exit"
)]
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
    let registry = ConnectorRegistry::new();

    let pending = db::count_pending_jobs(&pool).await?;
    info!(pending, "starting one-shot sync");
    if pending == 0 {
        info!("no sync jobs to process, exiting");
        return Ok(());
    }

    let mut processed = 0usize;
    let mut failed = 0usize;
    while let Some(sync_job) = db::claim_next_job(&pool).await? {
        let job_id = sync_job.id;
        match job::run_sync_job(&pool, store.as_ref(), &registry, sync_job).await {
            Ok(status) => {
                processed += 1;
                if !matches!(status, tabsync::model::JobStatus::Completed) {
                    failed += 1;
                }
                info!(job_id, status = status.as_str(), processed, "job finished");
            }
            Err(err) => {
                failed += 1;
                error!(?err, job_id, "job crashed");
                db::finish_job(
                    &pool,
                    job_id,
                    tabsync::model::JobStatus::Failed,
                    Some(&err.to_string()),
                )
                .await?;
            }
        }
    }

    info!(processed, failed, "one-shot sync finished");
    Ok(())
}
