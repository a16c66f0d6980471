use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Record files on disk are JSON documents.
pub const RECORD_EXTENSION: &str = ".json";

/// Default JSON key holding the remote identifier when a table spec does not
/// override it.
pub const DEFAULT_ID_FIELD: &str = "id";

/// Placeholder written into the identifier field of records created offline.
/// A record carrying it is unpublished; the value is stripped before the
/// record is sent to a connector.
pub const PENDING_PUBLISH_SENTINEL: &str = "__pending_publish__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Airtable,
    Notion,
    Webflow,
    Wix,
    Custom,
}

impl ConnectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorKind::Airtable => "airtable",
            ConnectorKind::Notion => "notion",
            ConnectorKind::Webflow => "webflow",
            ConnectorKind::Wix => "wix",
            ConnectorKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "airtable" => Some(ConnectorKind::Airtable),
            "notion" => Some(ConnectorKind::Notion),
            "webflow" => Some(ConnectorKind::Webflow),
            "wix" => Some(ConnectorKind::Wix),
            "custom" => Some(ConnectorKind::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory lock preventing concurrent sync operations on one folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderLock {
    Pull,
    Publish,
    Download,
}

impl FolderLock {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderLock::Pull => "pull",
            FolderLock::Publish => "publish",
            FolderLock::Download => "download",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pull" => Some(FolderLock::Pull),
            "publish" => Some(FolderLock::Publish),
            "download" => Some(FolderLock::Download),
            _ => None,
        }
    }
}

impl fmt::Display for FolderLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: i64,
    pub workbook_id: String,
    pub name: String,
    pub path: String,
    pub connector: Option<ConnectorKind>,
    pub lock: Option<FolderLock>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Connector-supplied metadata for a folder's table. Read-only input to the
/// naming resolver and diff extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub id_field: String,
    pub slug_field: Option<String>,
    pub title_fields: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: String,
}

impl TableSpec {
    pub fn with_defaults(slug_field: Option<&str>, title_fields: &[&str]) -> Self {
        Self {
            id_field: DEFAULT_ID_FIELD.to_string(),
            slug_field: slug_field.map(str::to_string),
            title_fields: title_fields.iter().map(|s| s.to_string()).collect(),
            columns: Vec::new(),
        }
    }

    /// Extract the remote identifier from a record's content. Empty strings
    /// and the pending-publish sentinel both count as "not published yet".
    pub fn remote_id_of(&self, content: &Value) -> Option<String> {
        let raw = content.get(&self.id_field)?.as_str()?;
        if raw.is_empty() || raw == PENDING_PUBLISH_SENTINEL {
            return None;
        }
        Some(raw.to_string())
    }

    pub fn slug_of(&self, content: &Value) -> Option<String> {
        let field = self.slug_field.as_ref()?;
        Some(content.get(field)?.as_str()?.to_string())
    }

    pub fn titles_of(&self, content: &Value) -> Vec<String> {
        self.title_fields
            .iter()
            .filter_map(|f| content.get(f).and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Modified,
    Deleted,
}

/// One changed file between the dirty and main branches. For added/modified
/// entries `content` holds the dirty copy; for deleted entries it holds the
/// last-synced copy (the dirty one no longer exists).
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
    pub content: String,
}

/// A create candidate. `path` doubles as the correlation key echoed back by
/// the connector, so result pairing never depends on array order.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub path: String,
    pub content: Value,
}

#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub path: String,
    pub remote_id: String,
    pub content: Value,
}

#[derive(Debug, Clone)]
pub struct RecordDelete {
    pub path: String,
    pub remote_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct PublishBuckets {
    pub creates: Vec<RecordDraft>,
    pub updates: Vec<RecordUpdate>,
    pub deletes: Vec<RecordDelete>,
}

impl PublishBuckets {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn counts(&self) -> BucketCounts {
        BucketCounts {
            creates: self.creates.len(),
            updates: self.updates.len(),
            deletes: self.deletes.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "active" => Some(JobStatus::Active),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Publish,
    Pull,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Publish => "publish",
            JobKind::Pull => "pull",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(JobKind::Publish),
            "pull" => Some(JobKind::Pull),
            _ => None,
        }
    }
}

/// Phases of a sync run, in the order they execute. Creates go first so a
/// later update or delete can reference a just-created record; deletes go
/// last so earlier failures never leave remote data partially removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Creates,
    Updates,
    Deletes,
    Pull,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Creates => "creates",
            SyncPhase::Updates => "updates",
            SyncPhase::Deletes => "deletes",
            SyncPhase::Pull => "pull",
        }
    }
}

/// Resume cursor persisted with every checkpoint. Granularity is one folder,
/// one phase, plus the number of items already committed in that phase, so a
/// resumed job never re-submits a confirmed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCursor {
    pub folder_index: usize,
    pub phase: SyncPhase,
    pub items_done: usize,
}

impl Default for JobCursor {
    fn default() -> Self {
        Self {
            folder_index: 0,
            phase: SyncPhase::Creates,
            items_done: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderSyncStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// UI-facing per-folder counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderProgress {
    pub id: i64,
    pub name: String,
    pub connector: Option<ConnectorKind>,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub expected_creates: usize,
    pub expected_updates: usize,
    pub expected_deletes: usize,
    pub status: FolderSyncStatus,
}

impl FolderProgress {
    pub fn pending(folder: &Folder) -> Self {
        Self {
            id: folder.id,
            name: folder.name.clone(),
            connector: folder.connector,
            creates: 0,
            updates: 0,
            deletes: 0,
            expected_creates: 0,
            expected_updates: 0,
            expected_deletes: 0,
            status: FolderSyncStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishProgress {
    pub total_published: usize,
    pub folders: Vec<FolderProgress>,
}

/// Persisted after every batch: what the UI shows, where to resume, and the
/// connector's own opaque cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub public_progress: PublishProgress,
    pub job_progress: JobCursor,
    pub connector_progress: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: i64,
    pub public_id: String,
    pub workbook_id: String,
    pub kind: JobKind,
    pub folder_ids: Vec<i64>,
    pub status: JobStatus,
    pub checkpoint: Option<Checkpoint>,
}

/// Path lists returned by a completed publish run.
#[derive(Debug, Clone, Default)]
pub struct PublishSummary {
    pub created_paths: Vec<String>,
    pub updated_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
    pub canceled: bool,
}
