use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tabsync::config;
use tabsync::db;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Job ID to inspect
    #[arg(long)]
    job_id: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tabsync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;

    let job = db::get_job(&pool, args.job_id).await?;
    println!("Job {} ({})", job.id, job.public_id);
    println!("  kind:    {}", job.kind.as_str());
    println!("  status:  {}", job.status.as_str());
    println!("  folders: {:?}", job.folder_ids);
    if let Some(checkpoint) = job.checkpoint {
        println!("  cursor:  {:?}", checkpoint.job_progress);
        println!(
            "  total published: {}",
            checkpoint.public_progress.total_published
        );
        for folder in checkpoint.public_progress.folders {
            println!(
                "    {} -> {:?} ({}/{} creates, {}/{} updates, {}/{} deletes)",
                folder.name,
                folder.status,
                folder.creates,
                folder.expected_creates,
                folder.updates,
                folder.expected_updates,
                folder.deletes,
                folder.expected_deletes,
            );
        }
    }
    Ok(())
}
