//! Optimistic-concurrency JSON patch path.
//!
//! ```text
//! Patch{v} ─► load ─► v == stored? ──no──► Conflict{stored version, content}
//!                          │yes
//!                          ▼
//!               apply to clone (v + 1)
//!                          │
//!            compare_and_swap(expected = v) ──lost──► Conflict
//!                          │won
//!                          ▼
//!        Applied{v + 1} + Patched/WorkspaceUpdated to the room
//! ```
//!
//! One patch per workspace is in flight at a time; the store's
//! compare-and-swap still guards against writers outside this process.

use json_patch::PatchOperation;
use schemaflow_core::{
    now_millis, patches_to_json, ConnectionId, PatchError, PatchedDocument, WorkspaceId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::membership::RoomTracker;
use crate::protocol::SyncMessage;
use crate::storage::{PatchDocumentStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied { version: u64 },
    /// Nothing was stored; the client must resync from `content`.
    Conflict { server_version: u64, content: Value },
}

#[derive(Debug, Error)]
pub enum PatchPathError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct PatchCoordinator {
    store: Arc<dyn PatchDocumentStore>,
    tracker: Arc<RoomTracker>,
    locks: Mutex<HashMap<WorkspaceId, Arc<Mutex<()>>>>,
}

impl PatchCoordinator {
    pub fn new(store: Arc<dyn PatchDocumentStore>, tracker: Arc<RoomTracker>) -> Self {
        Self {
            store,
            tracker,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, workspace_id: &WorkspaceId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(workspace_id.clone()).or_default().clone()
    }

    async fn load(&self, workspace_id: &WorkspaceId) -> Result<PatchedDocument, StoreError> {
        let store = self.store.clone();
        let ws = workspace_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load_document(&ws))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Ok(loaded.unwrap_or_else(|| PatchedDocument::new(workspace_id.clone())))
    }

    /// Authoritative document for a client asking to resync.
    pub async fn fetch_full(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<PatchedDocument, PatchPathError> {
        Ok(self.load(workspace_id).await?)
    }

    /// Drop the workspace lock once no other patch holds or waits on it.
    async fn release_lock(&self, workspace_id: &WorkspaceId) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(workspace_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(workspace_id);
        }
    }

    /// Workspaces with a patch in flight.
    pub async fn active_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Apply `patches` written against `client_version`.
    pub async fn apply_patch(
        &self,
        workspace_id: &WorkspaceId,
        patches: &[PatchOperation],
        client_version: u64,
        origin: ConnectionId,
        temp_id: &str,
    ) -> Result<PatchOutcome, PatchPathError> {
        let lock = self.lock_for(workspace_id).await;
        let outcome = {
            let _serial = lock.lock().await;
            self.apply_serialized(workspace_id, patches, client_version, origin, temp_id)
                .await
        };
        drop(lock);
        self.release_lock(workspace_id).await;
        outcome
    }

    async fn apply_serialized(
        &self,
        workspace_id: &WorkspaceId,
        patches: &[PatchOperation],
        client_version: u64,
        origin: ConnectionId,
        temp_id: &str,
    ) -> Result<PatchOutcome, PatchPathError> {
        let current = self.load(workspace_id).await?;
        let next = match current.apply(patches, client_version) {
            Ok(next) => next,
            Err(PatchError::VersionConflict { server_version, .. }) => {
                log::debug!(
                    "Patch {temp_id} on {workspace_id} conflicts: client {client_version}, server {server_version}"
                );
                return Ok(PatchOutcome::Conflict {
                    server_version,
                    content: current.content,
                });
            }
            Err(PatchError::InvalidPatch(reason)) | Err(PatchError::Malformed(reason)) => {
                return Err(PatchPathError::InvalidPatch(reason));
            }
        };

        let store = self.store.clone();
        let candidate = next.clone();
        let expected = current.version;
        let swapped =
            tokio::task::spawn_blocking(move || store.compare_and_swap(&candidate, expected))
                .await
                .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        if !swapped {
            let latest = self.load(workspace_id).await?;
            log::debug!(
                "Patch {temp_id} on {workspace_id} lost the write race at version {}",
                latest.version
            );
            return Ok(PatchOutcome::Conflict {
                server_version: latest.version,
                content: latest.content,
            });
        }

        if let Some(room) = self.tracker.room(workspace_id).await {
            let patched = SyncMessage::Patched {
                workspace_id: workspace_id.clone(),
                patches_json: patches_to_json(patches),
                version: next.version,
                origin,
                temp_id: temp_id.to_string(),
            };
            let notice = SyncMessage::WorkspaceUpdated {
                workspace_id: workspace_id.clone(),
                schema_id: None,
                version: Some(next.version),
                last_modified: now_millis(),
            };
            for msg in [&patched, &notice] {
                if let Err(e) = room.send(Some(origin), msg) {
                    log::error!("Failed to broadcast patch on {workspace_id}: {e}");
                }
            }
        }

        log::debug!("Patch {temp_id} on {workspace_id} applied at version {}", next.version);
        Ok(PatchOutcome::Applied {
            version: next.version,
        })
    }
}

/// Rejection reason acked for patches over the per-connection limit.
pub const RATE_LIMITED: &str = "rate_limited";

/// Fixed-window limit on patches per connection.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    /// `max_per_sec == 0` disables the limit.
    pub fn per_second(max_per_sec: u32) -> Self {
        Self {
            max_per_window: max_per_sec,
            window: Duration::from_secs(1),
            window_start: Instant::now(),
            count: 0,
        }
    }

    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    /// Count one request at `now`; `false` when it exceeds the window budget.
    pub fn check_at(&mut self, now: Instant) -> bool {
        if self.max_per_window == 0 {
            return true;
        }
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max_per_window {
            return false;
        }
        self.count += 1;
        true
    }
}
