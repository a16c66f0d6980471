//! Sqlite persistence: folder metadata, advisory locks, and the sync-job
//! queue with its per-job checkpoint and cancellation flag.

use crate::model::{Checkpoint, ConnectorKind, Folder, FolderLock, JobKind, JobStatus, SyncJob};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus full synchronous: checkpoints must survive a crash.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed sqlite URLs and make sure the parent
/// directory exists. In-memory URLs and non-sqlite schemes pass through.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{expanded}?{q}"),
        None => format!("sqlite://{expanded}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn create_folder(
    pool: &Pool,
    workbook_id: &str,
    name: &str,
    path: &str,
    connector: Option<ConnectorKind>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO folders (workbook_id, name, path, connector) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(workbook_id)
    .bind(name)
    .bind(path)
    .bind(connector.map(|c| c.as_str()))
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

fn folder_from_row(row: &SqliteRow) -> Result<Folder> {
    let connector: Option<String> = row.get("connector");
    let lock: Option<String> = row.get("lock");
    Ok(Folder {
        id: row.get("id"),
        workbook_id: row.get("workbook_id"),
        name: row.get("name"),
        path: row.get("path"),
        connector: match connector {
            Some(raw) => Some(
                ConnectorKind::parse(&raw).ok_or_else(|| anyhow!("unknown connector kind: {raw}"))?,
            ),
            None => None,
        },
        lock: match lock {
            Some(raw) => {
                Some(FolderLock::parse(&raw).ok_or_else(|| anyhow!("unknown folder lock: {raw}"))?)
            }
            None => None,
        },
        last_synced_at: row.get("last_synced_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_folder(pool: &Pool, id: i64) -> Result<Folder> {
    let row = sqlx::query(
        "SELECT id, workbook_id, name, path, connector, lock, last_synced_at \
         FROM folders WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("folder {id} not found"))?;
    folder_from_row(&row)
}

/// Take the folder's advisory lock. Returns false when another sync operation
/// already holds it; the conditional update makes the check-and-set atomic.
#[instrument(skip_all)]
pub async fn try_lock_folder(pool: &Pool, id: i64, lock: FolderLock) -> Result<bool> {
    let result = sqlx::query("UPDATE folders SET lock = ? WHERE id = ? AND lock IS NULL")
        .bind(lock.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn unlock_folder(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE folders SET lock = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn touch_folder_synced(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE folders SET last_synced_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    workbook_id: &str,
    kind: JobKind,
    folder_ids: &[i64],
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO sync_jobs (public_id, workbook_id, kind, folder_ids) \
         VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(workbook_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(folder_ids)?)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let folder_ids: String = row.get("folder_ids");
    let checkpoint: Option<String> = row.get("checkpoint");
    Ok(SyncJob {
        id: row.get("id"),
        public_id: row.get("public_id"),
        workbook_id: row.get("workbook_id"),
        kind: JobKind::parse(&kind).ok_or_else(|| anyhow!("unknown job kind: {kind}"))?,
        folder_ids: serde_json::from_str(&folder_ids).context("invalid folder_ids payload")?,
        status: JobStatus::parse(&status).ok_or_else(|| anyhow!("unknown job status: {status}"))?,
        checkpoint: match checkpoint {
            Some(raw) => Some(serde_json::from_str(&raw).context("invalid checkpoint payload")?),
            None => None,
        },
    })
}

/// Atomically claim the oldest pending job, marking it active.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool) -> Result<Option<SyncJob>> {
    let row = sqlx::query(
        "UPDATE sync_jobs SET status = 'active', started_at = ? \
         WHERE id = (SELECT id FROM sync_jobs WHERE status = 'pending' ORDER BY id LIMIT 1) \
         RETURNING id, public_id, workbook_id, kind, folder_ids, status, checkpoint",
    )
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Some(job_from_row(&row)?)),
        None => Ok(None),
    }
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, id: i64) -> Result<SyncJob> {
    let row = sqlx::query(
        "SELECT id, public_id, workbook_id, kind, folder_ids, status, checkpoint \
         FROM sync_jobs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| anyhow!("sync job {id} not found"))?;
    job_from_row(&row)
}

/// Put a failed or canceled job back in the queue, keeping its checkpoint so
/// the next run resumes instead of starting over.
#[instrument(skip_all)]
pub async fn requeue_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE sync_jobs SET status = 'pending', error = NULL, cancel_requested = 0, \
         finished_at = NULL WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn update_job_checkpoint(pool: &Pool, id: i64, checkpoint: &Checkpoint) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET checkpoint = ? WHERE id = ?")
        .bind(serde_json::to_string(checkpoint)?)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn finish_job(
    pool: &Pool,
    id: i64,
    status: JobStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET status = ?, error = ?, finished_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Out-of-band cancellation, keyed by job id; the runner observes it at the
/// next checkpoint boundary.
#[instrument(skip_all)]
pub async fn request_cancel(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE sync_jobs SET cancel_requested = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn cancel_requested(pool: &Pool, id: i64) -> Result<bool> {
    let flag: i64 = sqlx::query_scalar("SELECT cancel_requested FROM sync_jobs WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(flag != 0)
}

#[instrument(skip_all)]
pub async fn count_pending_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE status IN ('pending', 'active')")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobCursor, SyncPhase};

    async fn setup_pool() -> Pool {
        let pool = init_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn folder_lock_is_exclusive() {
        let pool = setup_pool().await;
        let id = create_folder(&pool, "wb", "Blog", "/blog", Some(ConnectorKind::Airtable))
            .await
            .unwrap();

        assert!(try_lock_folder(&pool, id, FolderLock::Publish).await.unwrap());
        assert!(!try_lock_folder(&pool, id, FolderLock::Pull).await.unwrap());

        let folder = get_folder(&pool, id).await.unwrap();
        assert_eq!(folder.lock, Some(FolderLock::Publish));

        unlock_folder(&pool, id).await.unwrap();
        assert!(try_lock_folder(&pool, id, FolderLock::Pull).await.unwrap());
    }

    #[tokio::test]
    async fn claim_marks_oldest_pending_active() {
        let pool = setup_pool().await;
        let first = enqueue_job(&pool, "wb", JobKind::Publish, &[1]).await.unwrap();
        let second = enqueue_job(&pool, "wb", JobKind::Pull, &[2]).await.unwrap();

        let claimed = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.kind, JobKind::Publish);
        assert_eq!(claimed.folder_ids, vec![1]);

        let claimed = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        assert!(claim_next_job(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkpoint_survives_requeue() {
        let pool = setup_pool().await;
        let id = enqueue_job(&pool, "wb", JobKind::Publish, &[7]).await.unwrap();
        claim_next_job(&pool).await.unwrap().unwrap();

        let mut checkpoint = Checkpoint::default();
        checkpoint.job_progress = JobCursor {
            folder_index: 1,
            phase: SyncPhase::Deletes,
            items_done: 3,
        };
        update_job_checkpoint(&pool, id, &checkpoint).await.unwrap();
        finish_job(&pool, id, JobStatus::Failed, Some("boom")).await.unwrap();

        requeue_job(&pool, id).await.unwrap();
        let job = claim_next_job(&pool).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        let restored = job.checkpoint.unwrap();
        assert_eq!(restored.job_progress.folder_index, 1);
        assert_eq!(restored.job_progress.phase, SyncPhase::Deletes);
        assert_eq!(restored.job_progress.items_done, 3);
    }

    #[tokio::test]
    async fn cancel_flag_round_trips() {
        let pool = setup_pool().await;
        let id = enqueue_job(&pool, "wb", JobKind::Pull, &[]).await.unwrap();
        assert!(!cancel_requested(&pool, id).await.unwrap());
        request_cancel(&pool, id).await.unwrap();
        assert!(cancel_requested(&pool, id).await.unwrap());
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        assert_eq!(prepare_sqlite_url("sqlite:///tmp/a.db"), "sqlite:///tmp/a.db");
    }
}
