//! Batch publisher: drives creates, updates, and deletes through a connector
//! in fixed-size batches, writes server-assigned identifiers and renamed
//! files back to the dirty branch, and reports progress after every batch.

use crate::connector::{BatchOp, Connector, CreatedRecord, RemoteRef};
use crate::diff;
use crate::error::SyncError;
use crate::model::{
    BucketCounts, PublishSummary, RecordDelete, RecordDraft, RecordUpdate, SyncPhase, TableSpec,
    PENDING_PUBLISH_SENTINEL, RECORD_EXTENSION,
};
use crate::naming;
use crate::store::{Branch, CommitFile, WorkingStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    Continue,
    Stop,
}

/// Callback invoked after every committed batch. The job runner persists a
/// checkpoint here and answers `Stop` when cancellation was requested;
/// cancellation is only ever observed at these boundaries, never mid-batch.
#[async_trait]
pub trait BatchReporter: Send {
    /// Called once per folder, before any connector call, with the expected
    /// bucket sizes.
    async fn on_buckets(&mut self, counts: BucketCounts) -> Result<()>;

    async fn on_batch(
        &mut self,
        phase: SyncPhase,
        count: usize,
        connector_progress: Option<Value>,
    ) -> Result<BatchControl>;
}

#[derive(Debug, Default)]
pub struct PhaseOutcome {
    pub paths: Vec<String>,
    pub canceled: bool,
}

fn serialize_record(content: &Value) -> Result<String> {
    let mut rendered =
        serde_json::to_string_pretty(content).context("failed to serialize record")?;
    rendered.push('\n');
    Ok(rendered)
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Remove the identifier field when it holds the pending-publish sentinel, so
/// a record created offline goes out without a bogus id.
fn strip_sentinel_id(spec: &TableSpec, draft: &RecordDraft) -> RecordDraft {
    let mut content = draft.content.clone();
    if let Some(obj) = content.as_object_mut() {
        if obj.get(&spec.id_field).and_then(Value::as_str) == Some(PENDING_PUBLISH_SENTINEL) {
            obj.remove(&spec.id_field);
        }
    }
    RecordDraft {
        path: draft.path.clone(),
        content,
    }
}

pub async fn publish_creates(
    store: &dyn WorkingStore,
    connector: &dyn Connector,
    workbook_id: &str,
    spec: &TableSpec,
    creates: &[RecordDraft],
    used_names: &mut HashSet<String>,
    reporter: &mut dyn BatchReporter,
) -> Result<PhaseOutcome> {
    // A draft already carrying a real remote id is a replayed create from an
    // interrupted run: the remote record exists, only the merge into main is
    // pending. Re-creating it would duplicate the record remotely.
    let pending: Vec<&RecordDraft> = creates
        .iter()
        .filter(|draft| {
            if spec.remote_id_of(&draft.content).is_some() {
                debug!(path = %draft.path, "create already has a remote id; skipping re-create");
                false
            } else {
                true
            }
        })
        .collect();

    let batch_size = connector.batch_size(BatchOp::Create).max(1);
    let mut outcome = PhaseOutcome::default();

    for batch in pending.chunks(batch_size) {
        let drafts: Vec<RecordDraft> = batch
            .iter()
            .map(|draft| strip_sentinel_id(spec, draft))
            .collect();
        let created = connector
            .create_records(spec, &drafts)
            .await
            .map_err(|err| SyncError::connector(connector.service_name(), err))?;
        let by_key: HashMap<&str, &CreatedRecord> =
            created.iter().map(|c| (c.key.as_str(), c)).collect();

        let mut commits = Vec::new();
        let mut superseded = Vec::new();
        for draft in batch {
            let Some(created) = by_key.get(draft.path.as_str()) else {
                warn!(path = %draft.path, "connector echoed no record for this create; leaving file unpublished");
                continue;
            };
            let canonical = &created.content;
            let new_path = match spec.remote_id_of(canonical) {
                Some(remote_id) => {
                    let base = naming::resolve_base_file_name(
                        spec.slug_of(canonical).as_deref(),
                        &spec.titles_of(canonical),
                        &remote_id,
                    );
                    let file =
                        naming::deduplicate_file_name(&base, RECORD_EXTENSION, used_names, &remote_id);
                    format!("{}/{}", parent_dir(&draft.path), file)
                }
                None => {
                    warn!(path = %draft.path, "created record is missing its identifier field; keeping original path");
                    draft.path.clone()
                }
            };
            commits.push(CommitFile::new(new_path.clone(), serialize_record(canonical)?));
            if new_path != draft.path {
                superseded.push(draft.path.clone());
            }
            outcome.paths.push(new_path);
        }

        // New contents land before superseded paths go, so a crash between
        // the two calls never loses data: replay re-writes identical content
        // and re-deleting an already-missing path is a no-op.
        store
            .commit_files(
                workbook_id,
                Branch::Dirty,
                &commits,
                "publish: record created records",
            )
            .await?;
        store
            .delete_files(
                workbook_id,
                Branch::Dirty,
                &superseded,
                "publish: drop superseded paths",
            )
            .await?;

        if reporter.on_batch(SyncPhase::Creates, batch.len(), None).await? == BatchControl::Stop {
            outcome.canceled = true;
            return Ok(outcome);
        }
    }
    Ok(outcome)
}

pub async fn publish_updates(
    connector: &dyn Connector,
    spec: &TableSpec,
    updates: &[RecordUpdate],
    skip: usize,
    reporter: &mut dyn BatchReporter,
) -> Result<PhaseOutcome> {
    let batch_size = connector.batch_size(BatchOp::Update).max(1);
    let mut outcome = PhaseOutcome::default();
    let remaining = &updates[skip.min(updates.len())..];

    for batch in remaining.chunks(batch_size) {
        let payloads: Vec<RecordUpdate> = batch
            .iter()
            .map(|update| {
                let mut content = update.content.clone();
                if let Some(obj) = content.as_object_mut() {
                    obj.insert(
                        spec.id_field.clone(),
                        Value::String(update.remote_id.clone()),
                    );
                }
                RecordUpdate {
                    path: update.path.clone(),
                    remote_id: update.remote_id.clone(),
                    content,
                }
            })
            .collect();
        connector
            .update_records(spec, &payloads)
            .await
            .map_err(|err| SyncError::connector(connector.service_name(), err))?;
        outcome
            .paths
            .extend(batch.iter().map(|update| update.path.clone()));

        if reporter.on_batch(SyncPhase::Updates, batch.len(), None).await? == BatchControl::Stop {
            outcome.canceled = true;
            return Ok(outcome);
        }
    }
    Ok(outcome)
}

pub async fn publish_deletes(
    connector: &dyn Connector,
    spec: &TableSpec,
    deletes: &[RecordDelete],
    skip: usize,
    reporter: &mut dyn BatchReporter,
) -> Result<PhaseOutcome> {
    let batch_size = connector.batch_size(BatchOp::Delete).max(1);
    let mut outcome = PhaseOutcome::default();
    let remaining = &deletes[skip.min(deletes.len())..];

    for batch in remaining.chunks(batch_size) {
        let refs: Vec<RemoteRef> = batch
            .iter()
            .map(|delete| RemoteRef {
                remote_id: delete.remote_id.clone(),
            })
            .collect();
        connector
            .delete_records(spec, &refs)
            .await
            .map_err(|err| SyncError::connector(connector.service_name(), err))?;
        outcome
            .paths
            .extend(batch.iter().map(|delete| delete.path.clone()));

        if reporter.on_batch(SyncPhase::Deletes, batch.len(), None).await? == BatchControl::Stop {
            outcome.canceled = true;
            return Ok(outcome);
        }
    }
    Ok(outcome)
}

/// Run a folder's full publish: diff, then creates, updates, deletes in that
/// fixed order. `resume` names the phase and the number of items already
/// committed in it from a previous run's checkpoint.
pub async fn publish_all(
    store: &dyn WorkingStore,
    connector: &dyn Connector,
    workbook_id: &str,
    folder_path: &str,
    spec: &TableSpec,
    resume: (SyncPhase, usize),
    reporter: &mut dyn BatchReporter,
) -> Result<(PublishSummary, BucketCounts)> {
    let buckets = diff::get_files_to_publish(store, workbook_id, folder_path, spec).await?;
    let counts = buckets.counts();
    reporter.on_buckets(counts).await?;

    let (resume_phase, resume_items) = resume;
    let mut summary = PublishSummary::default();
    let mut used_names: HashSet<String> = HashSet::new();

    if resume_phase <= SyncPhase::Creates {
        let created = publish_creates(
            store,
            connector,
            workbook_id,
            spec,
            &buckets.creates,
            &mut used_names,
            reporter,
        )
        .await?;
        summary.created_paths = created.paths;
        if created.canceled {
            summary.canceled = true;
            return Ok((summary, counts));
        }
    }

    let update_skip = match resume_phase {
        SyncPhase::Updates => resume_items,
        SyncPhase::Deletes | SyncPhase::Pull => buckets.updates.len(),
        SyncPhase::Creates => 0,
    };
    let updated = publish_updates(connector, spec, &buckets.updates, update_skip, reporter).await?;
    summary.updated_paths = updated.paths;
    if updated.canceled {
        summary.canceled = true;
        return Ok((summary, counts));
    }

    let delete_skip = match resume_phase {
        SyncPhase::Deletes => resume_items,
        _ => 0,
    };
    let deleted = publish_deletes(connector, spec, &buckets.deletes, delete_skip, reporter).await?;
    summary.deleted_paths = deleted.paths;
    summary.canceled = deleted.canceled;

    Ok((summary, counts))
}
