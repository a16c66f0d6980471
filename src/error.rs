use crate::model::FolderLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A connector call failed. Carries the service name so the UI can point
    /// at the integration that broke rather than a generic job failure.
    #[error("{service} connector error: {source}")]
    Connector {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    /// Another sync operation holds this folder's advisory lock.
    #[error("folder {folder} is locked for {lock}")]
    FolderLocked { folder: String, lock: FolderLock },

    /// A publish/pull job targets a folder bound to a connector kind nobody
    /// registered with the runner.
    #[error("no connector registered for {kind}")]
    UnknownConnector { kind: String },
}

impl SyncError {
    pub fn connector(service: impl Into<String>, source: anyhow::Error) -> Self {
        SyncError::Connector {
            service: service.into(),
            source,
        }
    }
}
