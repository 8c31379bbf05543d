//! Durable storage adapters for workspace documents.
//!
//! ```text
//! PersistenceScheduler ── upsert (version += 1) ──► SnapshotStore
//! PatchCoordinator     ── compare_and_swap ───────► PatchDocumentStore
//! ```
//!
//! [`RocksStore`] implements both, one column family each. [`MemoryStore`]
//! backs tests and servers started without a storage path.
//!
//! Both traits are blocking; async callers go through `spawn_blocking`.

pub mod memory;
pub mod rocks;

use schemaflow_core::{PatchedDocument, WorkspaceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Durable snapshot of one workspace's mergeable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub workspace_id: WorkspaceId,
    pub state: Vec<u8>,
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Snapshot persistence for the merge path.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Latest record, or `None` if the workspace was never persisted.
    fn load(&self, workspace_id: &WorkspaceId) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Replace the stored state and bump its version by one, atomically.
    fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        state: &[u8],
        last_modified: u64,
    ) -> Result<SnapshotRecord, StoreError>;
}

/// Document persistence for the patch path.
pub trait PatchDocumentStore: Send + Sync + 'static {
    fn load_document(&self, workspace_id: &WorkspaceId)
        -> Result<Option<PatchedDocument>, StoreError>;

    /// Store `document` only if the stored version is still `expected_version`
    /// (0 matches a missing document). Returns `false` when it is not.
    fn compare_and_swap(
        &self,
        document: &PatchedDocument,
        expected_version: u64,
    ) -> Result<bool, StoreError>;
}
