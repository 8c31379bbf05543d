//! In-memory store for tests and storage-less servers.

use schemaflow_core::{PatchedDocument, WorkspaceId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{PatchDocumentStore, SnapshotRecord, SnapshotStore, StoreError};

#[derive(Default)]
struct Tables {
    snapshots: HashMap<WorkspaceId, SnapshotRecord>,
    documents: HashMap<WorkspaceId, PatchedDocument>,
}

/// Hash-map backed store with call counters and failure injection.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    loads: AtomicU64,
    upserts: AtomicU64,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of snapshot loads served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of successful snapshot upserts.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store poisoned".into()))
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, workspace_id: &WorkspaceId) -> Result<Option<SnapshotRecord>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables()?.snapshots.get(workspace_id).cloned())
    }

    fn upsert(
        &self,
        workspace_id: &WorkspaceId,
        state: &[u8],
        last_modified: u64,
    ) -> Result<SnapshotRecord, StoreError> {
        let mut tables = self.tables()?;
        let version = tables
            .snapshots
            .get(workspace_id)
            .map_or(0, |r| r.version)
            + 1;
        let record = SnapshotRecord {
            workspace_id: workspace_id.clone(),
            state: state.to_vec(),
            version,
            last_modified,
        };
        tables.snapshots.insert(workspace_id.clone(), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }
}

impl PatchDocumentStore for MemoryStore {
    fn load_document(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Option<PatchedDocument>, StoreError> {
        Ok(self.tables()?.documents.get(workspace_id).cloned())
    }

    fn compare_and_swap(
        &self,
        document: &PatchedDocument,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables()?;
        let current = tables.documents.get(&document.id).map_or(0, |d| d.version);
        if current != expected_version {
            return Ok(false);
        }
        tables.documents.insert(document.id.clone(), document.clone());
        Ok(true)
    }
}
