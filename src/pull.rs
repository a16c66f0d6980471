//! Pull path: stream remote records into the main branch, then reconcile by
//! deleting local files whose records no longer exist remotely.

use crate::connector::{Connector, PullBatch};
use crate::error::SyncError;
use crate::model::{SyncPhase, TableSpec, RECORD_EXTENSION};
use crate::naming;
use crate::publish::{BatchControl, BatchReporter};
use crate::store::{Branch, CommitFile, WorkingStore};
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct PullOutcome {
    pub downloaded: usize,
    pub deleted_stale: usize,
    pub canceled: bool,
}

fn serialize_record(content: &Value) -> Result<String> {
    let mut rendered =
        serde_json::to_string_pretty(content).context("failed to serialize record")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Download all remote records for a folder and write them as named files on
/// the main branch, then remove files deleted remotely and rebase the dirty
/// overlay. Stale-file removal runs only after the full stream is consumed:
/// a partial stream must never be read as "everything else is gone".
pub async fn pull_folder(
    store: &dyn WorkingStore,
    connector: &dyn Connector,
    workbook_id: &str,
    folder_path: &str,
    spec: &TableSpec,
    progress_hint: Option<Value>,
    reporter: &mut dyn BatchReporter,
) -> Result<PullOutcome> {
    let (tx, mut rx) = mpsc::channel::<PullBatch>(4);
    // A resumed stream is partial: files pulled before the cursor never
    // reappear in it, so stale cleanup would wrongly remove them.
    let full_stream = progress_hint.is_none();
    let producer = connector.pull_record_files(spec, progress_hint, None, tx);

    let folder_prefix = folder_path.trim_end_matches('/').to_string();
    let mut used_names: HashSet<String> = HashSet::new();
    let mut downloaded: HashSet<String> = HashSet::new();
    let mut count = 0usize;
    let mut canceled = false;

    let consumer = {
        let used_names = &mut used_names;
        let downloaded = &mut downloaded;
        let count = &mut count;
        let canceled = &mut canceled;
        let folder_prefix = &folder_prefix;
        let reporter = &mut *reporter;
        async move {
            while let Some(batch) = rx.recv().await {
                let mut commits = Vec::new();
                for record in &batch.records {
                    let Some(remote_id) = spec.remote_id_of(record) else {
                        warn!("pulled record has no identifier; skipping");
                        continue;
                    };
                    let base = naming::resolve_base_file_name(
                        spec.slug_of(record).as_deref(),
                        &spec.titles_of(record),
                        &remote_id,
                    );
                    let file = naming::deduplicate_file_name(
                        &base,
                        RECORD_EXTENSION,
                        used_names,
                        &remote_id,
                    );
                    let path = format!("{folder_prefix}/{file}");
                    commits.push(CommitFile::new(path.clone(), serialize_record(record)?));
                    downloaded.insert(path);
                }
                // Pulled state lands on main, never dirty, so unpublished
                // local edits are not clobbered.
                store
                    .commit_files(workbook_id, Branch::Main, &commits, "pull: remote records")
                    .await?;
                *count += commits.len();

                let control = reporter
                    .on_batch(SyncPhase::Pull, commits.len(), batch.connector_progress)
                    .await?;
                if control == BatchControl::Stop {
                    *canceled = true;
                    break;
                }
            }
            anyhow::Ok(())
        }
    };

    let (produced, consumed) = tokio::join!(producer, consumer);
    consumed?;
    produced.map_err(|err| SyncError::connector(connector.service_name(), err))?;

    let mut outcome = PullOutcome {
        downloaded: count,
        deleted_stale: 0,
        canceled,
    };
    if canceled {
        return Ok(outcome);
    }

    // Remote-deleted records: anything on main under this folder that the
    // stream did not produce. Best effort; a leftover stale file is less
    // harmful than failing an otherwise-successful sync.
    if full_stream {
        match store.list_files(workbook_id, Branch::Main, folder_path).await {
            Ok(existing) => {
                let stale: Vec<String> = existing
                    .into_iter()
                    .filter(|path| path.ends_with(RECORD_EXTENSION) && !downloaded.contains(path))
                    .collect();
                if !stale.is_empty() {
                    match store
                        .delete_files(workbook_id, Branch::Main, &stale, "pull: remove remote-deleted records")
                        .await
                    {
                        Ok(()) => outcome.deleted_stale = stale.len(),
                        Err(err) => warn!(%err, "failed to remove remote-deleted files; continuing"),
                    }
                }
            }
            Err(err) => warn!(%err, "failed to list folder for stale cleanup; continuing"),
        }
    }

    // Replay main onto the dirty overlay so already-synced edits disappear
    // and in-progress ones survive.
    store.rebase_dirty(workbook_id).await?;

    info!(
        downloaded = outcome.downloaded,
        deleted_stale = outcome.deleted_stale,
        folder_path,
        "pull complete"
    );
    Ok(outcome)
}
