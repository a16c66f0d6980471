//! Resumable sync jobs: claim, run folder by folder, checkpoint after every
//! batch, and honor out-of-band cancellation at checkpoint boundaries.

use crate::connector::{Connector, ConnectorRegistry};
use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::{
    BucketCounts, Checkpoint, FolderLock, FolderProgress, FolderSyncStatus, JobCursor, JobKind,
    JobStatus, SyncJob, SyncPhase,
};
use crate::publish::{self, BatchControl, BatchReporter};
use crate::pull;
use crate::store::WorkingStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Persists a checkpoint after every batch and answers `Stop` once the job's
/// cancellation flag is set. All progress mutation funnels through here.
struct CheckpointReporter<'a> {
    pool: &'a Pool,
    job_id: i64,
    checkpoint: &'a mut Checkpoint,
    folder_index: usize,
}

#[async_trait]
impl BatchReporter for CheckpointReporter<'_> {
    async fn on_buckets(&mut self, counts: BucketCounts) -> Result<()> {
        if let Some(folder) = self
            .checkpoint
            .public_progress
            .folders
            .get_mut(self.folder_index)
        {
            folder.expected_creates = counts.creates;
            folder.expected_updates = counts.updates;
            folder.expected_deletes = counts.deletes;
            folder.status = FolderSyncStatus::InProgress;
        }
        db::update_job_checkpoint(self.pool, self.job_id, self.checkpoint).await
    }

    async fn on_batch(
        &mut self,
        phase: SyncPhase,
        count: usize,
        connector_progress: Option<Value>,
    ) -> Result<BatchControl> {
        let cursor = &mut self.checkpoint.job_progress;
        if cursor.folder_index == self.folder_index && cursor.phase == phase {
            cursor.items_done += count;
        } else {
            *cursor = JobCursor {
                folder_index: self.folder_index,
                phase,
                items_done: count,
            };
        }

        if let Some(folder) = self
            .checkpoint
            .public_progress
            .folders
            .get_mut(self.folder_index)
        {
            match phase {
                SyncPhase::Creates => folder.creates += count,
                SyncPhase::Updates => folder.updates += count,
                SyncPhase::Deletes => folder.deletes += count,
                SyncPhase::Pull => {}
            }
        }
        self.checkpoint.public_progress.total_published += count;
        if let Some(progress) = connector_progress {
            self.checkpoint.connector_progress = Some(progress);
        }
        db::update_job_checkpoint(self.pool, self.job_id, self.checkpoint).await?;

        if db::cancel_requested(self.pool, self.job_id).await? {
            info!(job_id = self.job_id, "cancellation observed at batch boundary");
            Ok(BatchControl::Stop)
        } else {
            Ok(BatchControl::Continue)
        }
    }
}

fn set_folder_status(checkpoint: &mut Checkpoint, index: usize, status: FolderSyncStatus) {
    if let Some(folder) = checkpoint.public_progress.folders.get_mut(index) {
        folder.status = status;
    }
}

/// Run one folder's sync under its advisory lock. Returns true when the job
/// was canceled mid-folder.
async fn sync_folder(
    pool: &Pool,
    store: &dyn WorkingStore,
    connector: &dyn Connector,
    job: &SyncJob,
    folder: &crate::model::Folder,
    folder_index: usize,
    resume: (SyncPhase, usize),
    checkpoint: &mut Checkpoint,
) -> Result<bool> {
    let spec = connector
        .table_spec(&folder.path)
        .await
        .map_err(|err| SyncError::connector(connector.service_name(), err))?;
    let hint = checkpoint.connector_progress.clone();
    let mut reporter = CheckpointReporter {
        pool,
        job_id: job.id,
        checkpoint,
        folder_index,
    };

    match job.kind {
        JobKind::Publish => {
            let (summary, _counts) = publish::publish_all(
                store,
                connector,
                &job.workbook_id,
                &folder.path,
                &spec,
                resume,
                &mut reporter,
            )
            .await?;
            if summary.canceled {
                return Ok(true);
            }
            // Publishing succeeded end to end: the dirty overlay becomes the
            // new last-synced state.
            store.merge_dirty(&job.workbook_id, &folder.path).await?;
            db::touch_folder_synced(pool, folder.id).await?;
            info!(
                folder = %folder.path,
                created = summary.created_paths.len(),
                updated = summary.updated_paths.len(),
                deleted = summary.deleted_paths.len(),
                "publish complete"
            );
            Ok(false)
        }
        JobKind::Pull => {
            let outcome = pull::pull_folder(
                store,
                connector,
                &job.workbook_id,
                &folder.path,
                &spec,
                hint,
                &mut reporter,
            )
            .await?;
            if outcome.canceled {
                return Ok(true);
            }
            db::touch_folder_synced(pool, folder.id).await?;
            Ok(false)
        }
    }
}

/// Drive a claimed job to a terminal state. Folder locks are cleared on every
/// path out, including failure and cancellation, so no folder is ever left
/// permanently stuck.
pub async fn run_sync_job(
    pool: &Pool,
    store: &dyn WorkingStore,
    registry: &ConnectorRegistry,
    job: SyncJob,
) -> Result<JobStatus> {
    let mut checkpoint = job.checkpoint.clone().unwrap_or_default();
    if checkpoint.public_progress.folders.is_empty() && !job.folder_ids.is_empty() {
        for folder_id in &job.folder_ids {
            let folder = db::get_folder(pool, *folder_id).await?;
            checkpoint
                .public_progress
                .folders
                .push(FolderProgress::pending(&folder));
        }
    }
    let lock_kind = match job.kind {
        JobKind::Publish => FolderLock::Publish,
        JobKind::Pull => FolderLock::Pull,
    };
    let start_index = checkpoint.job_progress.folder_index.min(job.folder_ids.len());

    for idx in start_index..job.folder_ids.len() {
        if db::cancel_requested(pool, job.id).await? {
            db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
            db::finish_job(pool, job.id, JobStatus::Canceled, None).await?;
            return Ok(JobStatus::Canceled);
        }

        let folder = db::get_folder(pool, job.folder_ids[idx]).await?;
        let Some(kind) = folder.connector else {
            debug!(folder = %folder.path, "folder has no connector; nothing to sync");
            set_folder_status(&mut checkpoint, idx, FolderSyncStatus::Completed);
            checkpoint.job_progress = JobCursor {
                folder_index: idx + 1,
                phase: SyncPhase::Creates,
                items_done: 0,
            };
            checkpoint.connector_progress = None;
            db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
            continue;
        };
        let Some(connector) = registry.get(kind) else {
            let err = SyncError::UnknownConnector {
                kind: kind.to_string(),
            };
            set_folder_status(&mut checkpoint, idx, FolderSyncStatus::Failed);
            db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
            db::finish_job(pool, job.id, JobStatus::Failed, Some(&err.to_string())).await?;
            return Ok(JobStatus::Failed);
        };

        if checkpoint.job_progress.folder_index != idx {
            // The connector cursor is per-folder state: carrying it into the
            // next folder would make its connector skip records.
            checkpoint.job_progress = JobCursor {
                folder_index: idx,
                phase: SyncPhase::Creates,
                items_done: 0,
            };
            checkpoint.connector_progress = None;
        }
        let resume = (
            checkpoint.job_progress.phase,
            checkpoint.job_progress.items_done,
        );
        set_folder_status(&mut checkpoint, idx, FolderSyncStatus::InProgress);
        // Persisted before the lock is taken: an error here must not leave
        // the folder locked.
        db::update_job_checkpoint(pool, job.id, &checkpoint).await?;

        if !db::try_lock_folder(pool, folder.id, lock_kind).await? {
            let held = folder.lock.unwrap_or(lock_kind);
            let err = SyncError::FolderLocked {
                folder: folder.path.clone(),
                lock: held,
            };
            warn!(folder = %folder.path, %err, "folder is locked by another sync operation");
            set_folder_status(&mut checkpoint, idx, FolderSyncStatus::Failed);
            db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
            db::finish_job(pool, job.id, JobStatus::Failed, Some(&err.to_string())).await?;
            return Ok(JobStatus::Failed);
        }

        let result = sync_folder(
            pool,
            store,
            connector.as_ref(),
            &job,
            &folder,
            idx,
            resume,
            &mut checkpoint,
        )
        .await;

        // The lock is cleared on every outcome; a folder must never stay
        // locked because its job failed or was canceled.
        if let Err(err) = db::unlock_folder(pool, folder.id).await {
            warn!(%err, folder_id = folder.id, "failed to clear folder lock");
        }

        match result {
            Ok(true) => {
                db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
                db::finish_job(pool, job.id, JobStatus::Canceled, None).await?;
                return Ok(JobStatus::Canceled);
            }
            Ok(false) => {
                set_folder_status(&mut checkpoint, idx, FolderSyncStatus::Completed);
                checkpoint.job_progress = JobCursor {
                    folder_index: idx + 1,
                    phase: SyncPhase::Creates,
                    items_done: 0,
                };
                checkpoint.connector_progress = None;
                db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
            }
            Err(err) => {
                error!(?err, folder = %folder.path, "folder sync failed");
                set_folder_status(&mut checkpoint, idx, FolderSyncStatus::Failed);
                db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
                db::finish_job(pool, job.id, JobStatus::Failed, Some(&err.to_string())).await?;
                return Ok(JobStatus::Failed);
            }
        }
    }

    db::update_job_checkpoint(pool, job.id, &checkpoint).await?;
    db::finish_job(pool, job.id, JobStatus::Completed, None).await?;
    Ok(JobStatus::Completed)
}

/// Worker loop: claim pending jobs one at a time and run them to completion.
/// The daemon spawns a small fixed number of these; folder locks keep two
/// workers from ever syncing the same folder concurrently.
pub async fn run_worker(
    pool: Pool,
    store: Arc<dyn WorkingStore>,
    registry: ConnectorRegistry,
    poll_interval: Duration,
) {
    loop {
        match db::claim_next_job(&pool).await {
            Ok(Some(job)) => {
                let job_id = job.id;
                match run_sync_job(&pool, store.as_ref(), &registry, job).await {
                    Ok(status) => {
                        info!(job_id, status = status.as_str(), "sync job finished");
                    }
                    Err(err) => {
                        error!(?err, job_id, "sync job crashed");
                        if let Err(err) =
                            db::finish_job(&pool, job_id, JobStatus::Failed, Some(&err.to_string()))
                                .await
                        {
                            error!(?err, job_id, "failed to record job failure");
                        }
                    }
                }
            }
            Ok(None) => tokio::time::sleep(poll_interval).await,
            Err(err) => {
                error!(?err, "failed to claim next job");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
