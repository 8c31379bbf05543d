//! # schemaflow-core: Replicated document model for schemaflow
//!
//! Everything here is transport-agnostic: the networking layer lives in
//! `schemaflow-collab` and only talks to documents through these types.
//!
//! ## Modules
//!
//! - [`ids`]: Workspace, connection and identity types
//! - [`mergeable`]: Opaque mergeable state (`MergeableState`) and its Yrs implementation
//! - [`patched`]: JSON document for the optimistic-concurrency path + client replica
//! - [`strategy`]: Per-client choice between the two sync paths
//!
//! Two synchronization paths share one workspace id space:
//!
//! ```text
//!            ┌──────────────────── SyncStrategy ───────────────────┐
//!            │                                                     │
//!        Merge                                                  Patch
//!            │                                                     │
//!  MergeableState (YrsState)                          PatchedDocument (JSON)
//!  commutative + idempotent merge                     version-match-or-conflict
//! ```

pub mod error;
pub mod ids;
pub mod mergeable;
pub mod patched;
pub mod strategy;

pub use error::{MergeError, PatchError};
pub use ids::{ConnectionId, Identity, WorkspaceId};
pub use mergeable::{KeyedEntries, MergeableState, YrsState};
pub use patched::{
    parse_patches, patches_to_json, OptimisticReplica, OutgoingPatch, PatchedDocument,
    ReplicaState,
};
pub use strategy::SyncStrategy;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
