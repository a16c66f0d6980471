use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use tabsync::connector::{
    BatchOp, Connector, ConnectorRegistry, CreatedRecord, PullBatch, RemoteRef,
};
use tabsync::db;
use tabsync::job;
use tabsync::model::{ConnectorKind, JobKind, JobStatus, RecordDraft, RecordUpdate, TableSpec};
use tabsync::store::{Branch, CommitFile, SqliteWorkingStore, WorkingStore};

const WB: &str = "wb-pull-job";

/// Streams canned record batches and remembers every progress hint it was
/// started with. Can flip the job's cancel flag between batches.
#[derive(Clone)]
struct StreamingConnector {
    batches: Arc<Vec<Vec<Value>>>,
    seen_hints: Arc<Mutex<Vec<Option<Value>>>>,
    cancel_after_first_batch: Arc<Mutex<Option<(db::Pool, i64)>>>,
}

impl StreamingConnector {
    fn new(batches: Vec<Vec<Value>>) -> Self {
        Self {
            batches: Arc::new(batches),
            seen_hints: Arc::new(Mutex::new(Vec::new())),
            cancel_after_first_batch: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl Connector for StreamingConnector {
    fn service_name(&self) -> &str {
        "streaming"
    }

    fn batch_size(&self, _op: BatchOp) -> usize {
        10
    }

    async fn table_spec(&self, _folder_path: &str) -> Result<TableSpec> {
        Ok(TableSpec::with_defaults(Some("slug"), &["title"]))
    }

    async fn create_records(
        &self,
        _spec: &TableSpec,
        _drafts: &[RecordDraft],
    ) -> Result<Vec<CreatedRecord>> {
        unreachable!("pull-only connector")
    }

    async fn update_records(&self, _spec: &TableSpec, _updates: &[RecordUpdate]) -> Result<()> {
        unreachable!("pull-only connector")
    }

    async fn delete_records(&self, _spec: &TableSpec, _refs: &[RemoteRef]) -> Result<()> {
        unreachable!("pull-only connector")
    }

    async fn pull_record_files(
        &self,
        _spec: &TableSpec,
        progress_hint: Option<Value>,
        _filter: Option<&Value>,
        tx: mpsc::Sender<PullBatch>,
    ) -> Result<()> {
        self.seen_hints.lock().await.push(progress_hint.clone());
        let skip = progress_hint
            .as_ref()
            .and_then(|v| v.get("offset"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        for (i, records) in self.batches.iter().enumerate().skip(skip) {
            let batch = PullBatch {
                records: records.clone(),
                connector_progress: Some(json!({"offset": i + 1})),
            };
            if tx.send(batch).await.is_err() {
                return Ok(());
            }
            if i == 0 {
                if let Some((pool, job_id)) = self.cancel_after_first_batch.lock().await.clone() {
                    db::request_cancel(&pool, job_id).await?;
                }
            }
        }
        Ok(())
    }
}

async fn setup() -> (db::Pool, SqliteWorkingStore) {
    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let store = SqliteWorkingStore::new(pool.clone());
    (pool, store)
}

fn registry_with(connector: &StreamingConnector) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    registry.register(ConnectorKind::Airtable, Arc::new(connector.clone()));
    registry
}

async fn run_next(
    pool: &db::Pool,
    store: &SqliteWorkingStore,
    registry: &ConnectorRegistry,
) -> (i64, JobStatus) {
    let claimed = db::claim_next_job(pool).await.unwrap().unwrap();
    let job_id = claimed.id;
    let status = job::run_sync_job(pool, store, registry, claimed).await.unwrap();
    (job_id, status)
}

#[tokio::test]
async fn pull_job_downloads_and_reconciles() {
    let (pool, store) = setup().await;
    let connector = StreamingConnector::new(vec![
        vec![json!({"id": "r1", "slug": "hello-world", "title": "Hello World"})],
        vec![json!({"id": "r2", "title": "Second Post"})],
    ]);
    let registry = registry_with(&connector);

    let folder_id = db::create_folder(&pool, WB, "Blog", "/blog", Some(ConnectorKind::Airtable))
        .await
        .unwrap();
    // Deleted remotely since the last pull.
    store
        .commit_files(
            WB,
            Branch::Main,
            &[CommitFile::new("/blog/stale.json", r#"{"id":"old"}"#)],
            "seed",
        )
        .await
        .unwrap();
    // An in-progress local edit that must survive the pull.
    store
        .commit_files(
            WB,
            Branch::Dirty,
            &[CommitFile::new("/blog/wip.json", r#"{"title":"wip"}"#)],
            "edit",
        )
        .await
        .unwrap();

    db::enqueue_job(&pool, WB, JobKind::Pull, &[folder_id]).await.unwrap();
    let (job_id, status) = run_next(&pool, &store, &registry).await;
    assert_eq!(status, JobStatus::Completed);

    let files = store.list_files(WB, Branch::Main, "/blog").await.unwrap();
    assert_eq!(files, vec!["/blog/hello-world.json", "/blog/second-post.json"]);

    // The dirty overlay was rebased, not cleared: the unsynced edit remains.
    let diff = store.get_folder_diff(WB, "/blog").await.unwrap();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].path, "/blog/wip.json");

    let folder = db::get_folder(&pool, folder_id).await.unwrap();
    assert_eq!(folder.lock, None);
    assert!(folder.last_synced_at.is_some());

    // The per-folder connector cursor is spent once the folder completes.
    let finished = db::get_job(&pool, job_id).await.unwrap();
    let checkpoint = finished.checkpoint.unwrap();
    assert_eq!(checkpoint.connector_progress, None);
}

#[tokio::test]
async fn connector_cursor_does_not_leak_across_folders() {
    let (pool, store) = setup().await;
    let connector = StreamingConnector::new(vec![vec![json!({"id": "r1", "title": "One"})]]);
    let registry = registry_with(&connector);

    let folder_a = db::create_folder(&pool, WB, "A", "/a", Some(ConnectorKind::Airtable))
        .await
        .unwrap();
    let folder_b = db::create_folder(&pool, WB, "B", "/b", Some(ConnectorKind::Airtable))
        .await
        .unwrap();
    // Deleted remotely; must be reconciled even though B is not the first
    // folder in the job.
    store
        .commit_files(
            WB,
            Branch::Main,
            &[CommitFile::new("/b/stale.json", r#"{"id":"old"}"#)],
            "seed",
        )
        .await
        .unwrap();

    db::enqueue_job(&pool, WB, JobKind::Pull, &[folder_a, folder_b]).await.unwrap();
    let (_, status) = run_next(&pool, &store, &registry).await;
    assert_eq!(status, JobStatus::Completed);

    // Each folder's stream starts from the beginning; the first folder's
    // cursor is not handed to the second.
    let hints = connector.seen_hints.lock().await;
    assert_eq!(*hints, vec![None, None]);
    drop(hints);

    let files = store.list_files(WB, Branch::Main, "/b").await.unwrap();
    assert_eq!(files, vec!["/b/one.json"]);
}

#[tokio::test]
async fn canceled_pull_resumes_from_connector_cursor() {
    let (pool, store) = setup().await;
    let connector = StreamingConnector::new(vec![
        vec![json!({"id": "r1", "title": "One"})],
        vec![json!({"id": "r2", "title": "Two"})],
    ]);
    let registry = registry_with(&connector);

    let folder_id = db::create_folder(&pool, WB, "Blog", "/blog", Some(ConnectorKind::Airtable))
        .await
        .unwrap();
    let job_id = db::enqueue_job(&pool, WB, JobKind::Pull, &[folder_id]).await.unwrap();
    *connector.cancel_after_first_batch.lock().await = Some((pool.clone(), job_id));

    let (_, status) = run_next(&pool, &store, &registry).await;
    assert_eq!(status, JobStatus::Canceled);

    let canceled = db::get_job(&pool, job_id).await.unwrap();
    let checkpoint = canceled.checkpoint.clone().unwrap();
    assert_eq!(checkpoint.connector_progress, Some(json!({"offset": 1})));

    *connector.cancel_after_first_batch.lock().await = None;
    db::requeue_job(&pool, job_id).await.unwrap();
    let (_, status) = run_next(&pool, &store, &registry).await;
    assert_eq!(status, JobStatus::Completed);

    // The second run started from the checkpointed cursor.
    let hints = connector.seen_hints.lock().await;
    assert_eq!(hints.len(), 2);
    assert_eq!(hints[0], None);
    assert_eq!(hints[1], Some(json!({"offset": 1})));
    drop(hints);

    let files = store.list_files(WB, Branch::Main, "/blog").await.unwrap();
    assert_eq!(files, vec!["/blog/one.json", "/blog/two.json"]);
}
