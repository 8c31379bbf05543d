//! Shared-schema upsert into the workspace's replicated document.
//!
//! Schemas live as JSON entries of the `schemas` map, so a save through
//! this service and a live edit through the merge path land in the same
//! document and reach peers the same way.

use schemaflow_core::{now_millis, ConnectionId, KeyedEntries, MergeError, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::membership::RoomTracker;
use crate::protocol::SyncMessage;
use crate::registry::DocumentRegistry;
use crate::scheduler::{FlushTrigger, PersistenceScheduler};

/// Map holding shared schemas, keyed by schema id.
pub const SCHEMAS_COLLECTION: &str = "schemas";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedSchema {
    pub schema_id: String,
    pub name: String,
    pub content: Value,
    /// Bumped on every save of this schema.
    pub version: u64,
    pub last_modified: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSaved {
    pub version: u64,
    pub last_modified: u64,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("schema encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub struct SchemaService<S> {
    registry: Arc<DocumentRegistry<S>>,
    tracker: Arc<RoomTracker>,
    scheduler: PersistenceScheduler,
}

impl<S: KeyedEntries> SchemaService<S> {
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

    /// Write `content` as schema `schema_id` of the workspace.
    ///
    /// The resulting merge update goes to the room like any peer update,
    /// followed by a `WorkspaceUpdated` notice. `origin` is skipped for
    /// both when the save came from a connected client.
    pub async fn update_shared_schema(
        &self,
        workspace_id: &WorkspaceId,
        schema_id: &str,
        name: &str,
        content: Value,
        origin: Option<ConnectionId>,
    ) -> Result<SchemaSaved, SchemaError> {
        let doc = self.registry.get_or_create(workspace_id).await;
        let mut st = doc.lock().await;

        let previous = st
            .state
            .get_entry(SCHEMAS_COLLECTION, schema_id)
            .and_then(|raw| serde_json::from_str::<SharedSchema>(&raw).ok())
            .map_or(0, |s| s.version);
        let record = SharedSchema {
            schema_id: schema_id.to_string(),
            name: name.to_string(),
            content,
            version: previous + 1,
            last_modified: now_millis(),
        };
        let encoded = serde_json::to_string(&record)?;
        let update = st.state.put_entry(SCHEMAS_COLLECTION, schema_id, &encoded)?;
        st.pending_updates = st.pending_updates.saturating_add(1);

        if let Some(room) = self.tracker.room(workspace_id).await {
            let merged = SyncMessage::Update {
                workspace_id: workspace_id.clone(),
                update,
            };
            let notice = SyncMessage::WorkspaceUpdated {
                workspace_id: workspace_id.clone(),
                schema_id: Some(schema_id.to_string()),
                version: Some(record.version),
                last_modified: record.last_modified,
            };
            for msg in [&merged, &notice] {
                if let Err(e) = room.send(origin, msg) {
                    log::error!("Failed to broadcast schema {schema_id} in {workspace_id}: {e}");
                }
            }
        }

        self.scheduler
            .schedule_locked(&doc, &mut st, FlushTrigger::SchemaChange);
        log::info!(
            "Saved schema {schema_id} in {workspace_id} (version {})",
            record.version
        );

        Ok(SchemaSaved {
            version: record.version,
            last_modified: record.last_modified,
        })
    }

    /// Current value of one shared schema.
    pub async fn shared_schema(
        &self,
        workspace_id: &WorkspaceId,
        schema_id: &str,
    ) -> Option<SharedSchema> {
        let doc = self.registry.get_or_create(workspace_id).await;
        let st = doc.lock().await;
        let raw = st.state.get_entry(SCHEMAS_COLLECTION, schema_id)?;
        serde_json::from_str(&raw).ok()
    }
}
