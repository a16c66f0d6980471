//! Diff extraction: classify changed record files into create, update, and
//! delete buckets for one folder.

use crate::model::{
    DiffStatus, PublishBuckets, RecordDelete, RecordDraft, RecordUpdate, TableSpec,
    RECORD_EXTENSION,
};
use crate::store::WorkingStore;
use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

/// Compute the three publish buckets from the dirty-vs-main diff of one
/// folder. The buckets partition the changed-file set: no path lands in more
/// than one. One malformed file never aborts the whole diff; it is logged
/// and skipped.
pub async fn get_files_to_publish(
    store: &dyn WorkingStore,
    workbook_id: &str,
    folder_path: &str,
    spec: &TableSpec,
) -> Result<PublishBuckets> {
    let entries = store.get_folder_diff(workbook_id, folder_path).await?;
    let mut buckets = PublishBuckets::default();

    for entry in entries {
        if !entry.path.ends_with(RECORD_EXTENSION) {
            continue;
        }
        let content: Value = match serde_json::from_str(&entry.content) {
            Ok(v) => v,
            Err(err) => {
                warn!(path = %entry.path, %err, "skipping unparseable record file");
                continue;
            }
        };

        match entry.status {
            DiffStatus::Added => buckets.creates.push(RecordDraft {
                path: entry.path,
                content,
            }),
            DiffStatus::Modified => match spec.remote_id_of(&content) {
                Some(remote_id) => buckets.updates.push(RecordUpdate {
                    path: entry.path,
                    remote_id,
                    content,
                }),
                None => {
                    // A modified file with no remote id cannot be an update.
                    info!(path = %entry.path, "modified record has no remote id; treating as create");
                    buckets.creates.push(RecordDraft {
                        path: entry.path,
                        content,
                    });
                }
            },
            DiffStatus::Deleted => match spec.remote_id_of(&content) {
                Some(remote_id) => buckets.deletes.push(RecordDelete {
                    path: entry.path,
                    remote_id,
                }),
                None => {
                    warn!(path = %entry.path, "deleted record was never published; nothing to delete remotely");
                }
            },
        }
    }

    Ok(buckets)
}
