//! Incremental update ingestion: merge, rebroadcast, schedule persistence.

use schemaflow_core::{ConnectionId, MergeableState, WorkspaceId};
use std::sync::Arc;

use crate::membership::RoomTracker;
use crate::protocol::SyncMessage;
use crate::registry::DocumentRegistry;
use crate::scheduler::{FlushTrigger, PersistenceScheduler};

/// Result of ingesting one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Merged and forwarded to this many receivers.
    Merged { forwarded: usize },
    /// The update failed to decode or apply and was dropped.
    Dropped,
}

pub struct Ingestor<S> {
    registry: Arc<DocumentRegistry<S>>,
    tracker: Arc<RoomTracker>,
    scheduler: PersistenceScheduler,
}

impl<S: MergeableState> Ingestor<S> {
    pub fn new(
        registry: Arc<DocumentRegistry<S>>,
        tracker: Arc<RoomTracker>,
        scheduler: PersistenceScheduler,
    ) -> Self {
        Self {
            registry,
            tracker,
            scheduler,
        }
    }

    /// Merge `update` into the workspace document and forward it to every
    /// other member of the room.
    ///
    /// The broadcast happens under the document lock, so peers observe
    /// updates in merge order.
    pub async fn apply_update(
        &self,
        workspace_id: &WorkspaceId,
        update: &[u8],
        origin: ConnectionId,
    ) -> IngestOutcome {
        let doc = self.registry.get_or_create(workspace_id).await;
        let mut st = doc.lock().await;

        if let Err(e) = st.state.merge(update) {
            log::warn!("Dropping update from {origin} for {workspace_id}: {e}");
            return IngestOutcome::Dropped;
        }
        st.pending_updates = st.pending_updates.saturating_add(1);

        let forwarded = match self.tracker.room(workspace_id).await {
            Some(room) => {
                let msg = SyncMessage::Update {
                    workspace_id: workspace_id.clone(),
                    update: update.to_vec(),
                };
                match room.send(Some(origin), &msg) {
                    // the origin's own receiver is counted but skips the frame
                    Ok(n) => n.saturating_sub(1),
                    Err(e) => {
                        log::error!("Failed to encode update for {workspace_id}: {e}");
                        0
                    }
                }
            }
            None => {
                log::debug!("No room for {workspace_id}, update merged without broadcast");
                0
            }
        };

        self.scheduler
            .schedule_locked(&doc, &mut st, FlushTrigger::Merge);
        IngestOutcome::Merged { forwarded }
    }
}
