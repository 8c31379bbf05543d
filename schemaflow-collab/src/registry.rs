//! Per-workspace replicated documents, hydrated lazily from the store.
//!
//! ```text
//! get_or_create(W) ─► map lookup ─► OnceCell<ReplicatedDocument>
//!                                      │ first caller only
//!                                      ▼
//!                         spawn_blocking(store.load(W))
//!                                      │
//!                 Some(record) ── hydrate ──► state @ record.version
//!                 None / error ─────────────► empty state @ 0
//! ```
//!
//! Concurrent first joins of one workspace share a single hydration; other
//! workspaces are never blocked by it.

use schemaflow_core::{MergeableState, WorkspaceId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::membership::RoomTracker;
use crate::scheduler::PersistenceScheduler;
use crate::storage::SnapshotStore;

/// Mutable part of a document, guarded by the document mutex.
pub struct DocState<S> {
    pub state: S,
    /// Version of the last durable flush.
    pub version: u64,
    /// Updates merged since the last flush.
    pub pending_updates: u32,
    /// Milliseconds since the Unix epoch of the last flush.
    pub last_modified: u64,
    pub(crate) flush_timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is replaced; a woken timer with a stale
    /// generation does nothing.
    pub(crate) timer_generation: u64,
    /// Set when the registry dropped this document.
    pub(crate) evicted: bool,
}

impl<S> DocState<S> {
    pub fn has_flush_timer(&self) -> bool {
        self.flush_timer.is_some()
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }
}

/// One workspace's authoritative replica.
pub struct ReplicatedDocument<S> {
    workspace_id: WorkspaceId,
    inner: Mutex<DocState<S>>,
    /// Held for the duration of a flush so flushes never overlap.
    pub(crate) flush_lock: Mutex<()>,
}

impl<S: MergeableState> ReplicatedDocument<S> {
    pub fn new(workspace_id: WorkspaceId, state: S, version: u64, last_modified: u64) -> Self {
        Self {
            workspace_id,
            inner: Mutex::new(DocState {
                state,
                version,
                pending_updates: 0,
                last_modified,
                flush_timer: None,
                timer_generation: 0,
                evicted: false,
            }),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn workspace_id(&self) -> &WorkspaceId {
        &self.workspace_id
    }

    /// Lock the document. Merges into one workspace serialize here.
    pub async fn lock(&self) -> MutexGuard<'_, DocState<S>> {
        self.inner.lock().await
    }

    /// Full encoded state and its version.
    pub async fn snapshot(&self) -> (Vec<u8>, u64) {
        let st = self.inner.lock().await;
        (st.state.encode(), st.version)
    }

    pub async fn version(&self) -> u64 {
        self.inner.lock().await.version
    }

    pub async fn pending_updates(&self) -> u32 {
        self.inner.lock().await.pending_updates
    }
}

type Slot<S> = Arc<OnceCell<Arc<ReplicatedDocument<S>>>>;

/// Registry of resident documents.
pub struct DocumentRegistry<S> {
    store: Arc<dyn SnapshotStore>,
    docs: RwLock<HashMap<WorkspaceId, Slot<S>>>,
}

impl<S: MergeableState> DocumentRegistry<S> {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Resident document for `workspace_id`, hydrating it on first use.
    pub async fn get_or_create(&self, workspace_id: &WorkspaceId) -> Arc<ReplicatedDocument<S>> {
        let slot = {
            let docs = self.docs.read().await;
            docs.get(workspace_id).cloned()
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut docs = self.docs.write().await;
                docs.entry(workspace_id.clone()).or_default().clone()
            }
        };

        slot.get_or_init(|| self.hydrate(workspace_id.clone()))
            .await
            .clone()
    }

    /// Resident document, without hydrating.
    pub async fn get(&self, workspace_id: &WorkspaceId) -> Option<Arc<ReplicatedDocument<S>>> {
        let docs = self.docs.read().await;
        docs.get(workspace_id).and_then(|slot| slot.get().cloned())
    }

    /// Full state of a resident document; `None` if it was never hydrated.
    pub async fn encode_full_state(&self, workspace_id: &WorkspaceId) -> Option<Vec<u8>> {
        let doc = self.get(workspace_id).await?;
        let st = doc.lock().await;
        Some(st.state.encode())
    }

    async fn hydrate(&self, workspace_id: WorkspaceId) -> Arc<ReplicatedDocument<S>> {
        let store = self.store.clone();
        let ws = workspace_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&ws)).await;

        let doc = match loaded {
            Ok(Ok(Some(record))) => match S::hydrate(&record.state) {
                Ok(state) => {
                    log::info!(
                        "Hydrated workspace {workspace_id} at version {}",
                        record.version
                    );
                    ReplicatedDocument::new(
                        workspace_id,
                        state,
                        record.version,
                        record.last_modified,
                    )
                }
                Err(e) => {
                    log::warn!("Corrupt snapshot for {workspace_id}, starting empty: {e}");
                    ReplicatedDocument::new(workspace_id, S::init(), 0, 0)
                }
            },
            Ok(Ok(None)) => {
                log::info!("Workspace {workspace_id} has no snapshot, starting empty");
                ReplicatedDocument::new(workspace_id, S::init(), 0, 0)
            }
            Ok(Err(e)) => {
                log::warn!("Snapshot store unavailable for {workspace_id}, starting empty: {e}");
                ReplicatedDocument::new(workspace_id, S::init(), 0, 0)
            }
            Err(e) => {
                log::warn!("Hydration task for {workspace_id} failed, starting empty: {e}");
                ReplicatedDocument::new(workspace_id, S::init(), 0, 0)
            }
        };
        Arc::new(doc)
    }

    /// Flush and drop a document whose room emptied.
    ///
    /// The document stays resident when a member rejoined meanwhile or the
    /// flush failed. Returns whether it was evicted.
    pub async fn release(
        &self,
        workspace_id: &WorkspaceId,
        scheduler: &PersistenceScheduler,
        tracker: &RoomTracker,
    ) -> bool {
        let Some(doc) = self.get(workspace_id).await else {
            return false;
        };
        if !scheduler.flush_now(&doc).await {
            log::warn!("Keeping {workspace_id} resident: final flush failed");
            return false;
        }

        // Lock order: registry map, document, tracker
        let mut docs = self.docs.write().await;
        let mut st = doc.lock().await;
        if st.pending_updates > 0 || st.flush_timer.is_some() {
            return false;
        }
        if !tracker.is_room_empty(workspace_id).await {
            return false;
        }
        st.evicted = true;
        docs.remove(workspace_id);
        log::info!("Evicted workspace {workspace_id} (room empty)");
        true
    }

    /// Number of hydrated documents.
    pub async fn resident_count(&self) -> usize {
        let docs = self.docs.read().await;
        docs.values().filter(|slot| slot.initialized()).count()
    }
}
