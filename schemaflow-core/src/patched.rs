//! JSON document under optimistic concurrency.
//!
//! Clients that cannot run a mergeable replica edit a plain JSON document
//! with RFC 6902 patches. A patch only lands when the client's base version
//! equals the stored version; anything else is a conflict and the client
//! resynchronizes from the authoritative copy.

use json_patch::PatchOperation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PatchError;
use crate::ids::WorkspaceId;

/// Authoritative JSON document with a monotonic version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchedDocument {
    pub id: WorkspaceId,
    pub version: u64,
    pub content: Value,
}

impl PatchedDocument {
    /// Empty object at version 0.
    pub fn new(id: WorkspaceId) -> Self {
        Self {
            id,
            version: 0,
            content: Value::Object(Default::default()),
        }
    }

    pub fn with_content(id: WorkspaceId, version: u64, content: Value) -> Self {
        Self {
            id,
            version,
            content,
        }
    }

    /// Apply `patches` written against `client_version`.
    ///
    /// Returns the next document (version + 1). `self` is never modified,
    /// so a failed apply leaves the stored state untouched.
    pub fn apply(
        &self,
        patches: &[PatchOperation],
        client_version: u64,
    ) -> Result<PatchedDocument, PatchError> {
        if client_version != self.version {
            return Err(PatchError::VersionConflict {
                client_version,
                server_version: self.version,
            });
        }

        let mut content = self.content.clone();
        json_patch::patch(&mut content, patches)
            .map_err(|e| PatchError::InvalidPatch(e.to_string()))?;

        Ok(PatchedDocument {
            id: self.id.clone(),
            version: self.version + 1,
            content,
        })
    }
}

/// Parse a JSON patch array.
pub fn parse_patches(json: &str) -> Result<Vec<PatchOperation>, PatchError> {
    let patch: json_patch::Patch =
        serde_json::from_str(json).map_err(|e| PatchError::Malformed(e.to_string()))?;
    Ok(patch.0)
}

/// Serialize patch operations back to a JSON array.
pub fn patches_to_json(patches: &[PatchOperation]) -> String {
    serde_json::to_string(patches).unwrap_or_else(|_| "[]".to_string())
}

/// Client replica sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Local content equals the last confirmed server version.
    Synced,
    /// A patch is in flight, awaiting its ack.
    Pending,
    /// A conflict was reported; waiting for the full document.
    Resyncing,
}

/// Patch ready to be sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPatch {
    pub patches: Vec<PatchOperation>,
    pub base_version: u64,
    pub temp_id: String,
}

/// Client side of the patch path.
///
/// Edits apply locally at once. One patch is in flight at a time; edits
/// made while it is pending are batched into the next one.
#[derive(Debug)]
pub struct OptimisticReplica {
    document: PatchedDocument,
    state: ReplicaState,
    in_flight: Option<OutgoingPatch>,
    queued: Vec<PatchOperation>,
    next_temp_id: u64,
}

impl OptimisticReplica {
    pub fn new(document: PatchedDocument) -> Self {
        Self {
            document,
            state: ReplicaState::Synced,
            in_flight: None,
            queued: Vec::new(),
            next_temp_id: 1,
        }
    }

    pub fn state(&self) -> ReplicaState {
        self.state
    }

    /// Local view of the content, including unacknowledged edits.
    pub fn content(&self) -> &Value {
        &self.document.content
    }

    /// Last version confirmed by the server.
    pub fn version(&self) -> u64 {
        self.document.version
    }

    /// Apply a local edit.
    ///
    /// Returns the patch to send when the replica was synced. While a patch
    /// is pending the edit is queued. While resyncing, local edits are
    /// rejected with `Ok(None)` and not applied, since the content is about
    /// to be replaced.
    pub fn local_edit(
        &mut self,
        patches: Vec<PatchOperation>,
    ) -> Result<Option<OutgoingPatch>, PatchError> {
        if self.state == ReplicaState::Resyncing {
            return Ok(None);
        }

        json_patch::patch(&mut self.document.content, &patches)
            .map_err(|e| PatchError::InvalidPatch(e.to_string()))?;

        match self.state {
            ReplicaState::Synced => Ok(Some(self.send(patches))),
            _ => {
                self.queued.extend(patches);
                Ok(None)
            }
        }
    }

    /// Server accepted the in-flight patch at `version`.
    ///
    /// Returns the next batch if edits were queued meanwhile.
    pub fn on_ack(&mut self, temp_id: &str, version: u64) -> Option<OutgoingPatch> {
        match &self.in_flight {
            Some(p) if p.temp_id == temp_id => {}
            _ => return None,
        }
        self.in_flight = None;
        self.document.version = version;
        self.state = ReplicaState::Synced;

        if self.queued.is_empty() {
            None
        } else {
            let next = std::mem::take(&mut self.queued);
            Some(self.send(next))
        }
    }

    /// Server rejected the in-flight patch. Unacknowledged edits are dropped.
    pub fn on_conflict(&mut self) {
        self.in_flight = None;
        self.queued.clear();
        self.state = ReplicaState::Resyncing;
    }

    /// Authoritative document received.
    pub fn on_full_document(&mut self, version: u64, content: Value) {
        self.document.version = version;
        self.document.content = content;
        self.in_flight = None;
        self.queued.clear();
        self.state = ReplicaState::Synced;
    }

    /// Another client's patch, broadcast at `version`.
    ///
    /// Applies only when synced and exactly one version ahead. A gap moves
    /// the replica to `Resyncing` and returns `false`; the caller then
    /// requests the full document. While pending the patch is ignored, the
    /// in-flight patch will conflict and trigger the resync.
    pub fn on_remote_patch(&mut self, patches: &[PatchOperation], version: u64) -> bool {
        match self.state {
            ReplicaState::Synced if version == self.document.version + 1 => {
                if json_patch::patch(&mut self.document.content, patches).is_err() {
                    self.state = ReplicaState::Resyncing;
                    return false;
                }
                self.document.version = version;
                true
            }
            ReplicaState::Synced if version <= self.document.version => true,
            ReplicaState::Synced => {
                self.state = ReplicaState::Resyncing;
                false
            }
            _ => false,
        }
    }

    fn send(&mut self, patches: Vec<PatchOperation>) -> OutgoingPatch {
        let outgoing = OutgoingPatch {
            patches,
            base_version: self.document.version,
            temp_id: format!("tmp-{}", self.next_temp_id),
        };
        self.next_temp_id += 1;
        self.in_flight = Some(outgoing.clone());
        self.state = ReplicaState::Pending;
        outgoing
    }
}
