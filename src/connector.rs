//! The contract every remote integration implements. The publish and pull
//! pipelines only ever talk to this trait; a statically-coded integration and
//! a tenant-defined one look identical from here.

use crate::model::{RecordDraft, RecordUpdate, TableSpec};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::model::ConnectorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOp {
    Create,
    Update,
    Delete,
}

impl BatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOp::Create => "create",
            BatchOp::Update => "update",
            BatchOp::Delete => "delete",
        }
    }
}

/// One created record as echoed back by the connector. `key` is the
/// caller-supplied correlation key (the record's workspace path); pairing by
/// key instead of array position keeps the result unambiguous even when a
/// connector reorders or drops items.
#[derive(Debug, Clone)]
pub struct CreatedRecord {
    pub key: String,
    pub content: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteRef {
    pub remote_id: String,
}

/// One streamed batch of remote records during a pull, with the connector's
/// opaque resume cursor as of this batch.
#[derive(Debug, Clone)]
pub struct PullBatch {
    pub records: Vec<Value>,
    pub connector_progress: Option<Value>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Service name used for error attribution ("airtable", "webflow", ...).
    fn service_name(&self) -> &str;

    /// Maximum items per call for one operation kind. Must be > 0; the
    /// limits may differ per operation.
    fn batch_size(&self, op: BatchOp) -> usize;

    /// Table metadata for the folder at `folder_path`: which field holds the
    /// remote identifier, the slug, the display titles, and the columns.
    async fn table_spec(&self, folder_path: &str) -> Result<TableSpec>;

    /// Create records remotely. Drafts arrive with no identifier field
    /// populated. The returned records are the connector's canonical
    /// representation, each carrying its draft's correlation key and the
    /// identifier field filled in.
    async fn create_records(
        &self,
        spec: &TableSpec,
        drafts: &[RecordDraft],
    ) -> Result<Vec<CreatedRecord>>;

    /// Update records that already carry their remote identifier.
    async fn update_records(&self, spec: &TableSpec, updates: &[RecordUpdate]) -> Result<()>;

    async fn delete_records(&self, spec: &TableSpec, refs: &[RemoteRef]) -> Result<()>;

    /// Stream all remote records, zero or more batches, by sending into `tx`.
    /// `progress_hint` is a cursor from a previous run's checkpoint; `filter`
    /// is connector-defined. A closed receiver means the caller stopped
    /// consuming; implementations should return Ok(()) in that case.
    async fn pull_record_files(
        &self,
        spec: &TableSpec,
        progress_hint: Option<Value>,
        filter: Option<&Value>,
        tx: mpsc::Sender<PullBatch>,
    ) -> Result<()>;
}

/// Kind-keyed lookup used by the job runner to find the integration a folder
/// is bound to.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<ConnectorKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ConnectorKind, connector: Arc<dyn Connector>) {
        self.connectors.insert(kind, connector);
    }

    pub fn get(&self, kind: ConnectorKind) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
