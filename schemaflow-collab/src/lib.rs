//! # schemaflow-collab: Real-time sync engine for shared schema documents
//!
//! Keeps every editor's replica of a workspace document consistent, writes
//! the document to durable storage without write storms, and relays cursors
//! at interactive rates.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per user)  │     Binary Proto    │  ├─ RoomTracker (rooms)      │
//! └─────────────┘                     │  ├─ Ingestor ─► Registry     │
//!                                     │  ├─ PatchCoordinator         │
//!                                     │  └─ SchemaService            │
//!                                     └──────────────┬───────────────┘
//!                                                    │ debounced
//!                                           ┌────────▼────────┐
//!                                           │ SnapshotStore   │
//!                                           │ (RocksDB / mem) │
//!                                           └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`storage`]: Snapshot and patch-document stores
//! - [`registry`]: Lazily hydrated per-workspace documents
//! - [`scheduler`]: Count + time debounced persistence
//! - [`ingest`]: Merge and rebroadcast of peer updates
//! - [`broadcast`] / [`membership`]: Rooms and fan-out
//! - [`presence`]: Cursor relay payloads, interpolation and eviction
//! - [`patch_path`]: Optimistic-concurrency JSON patches
//! - [`schema`]: Shared-schema upsert
//! - [`auth`] / [`config`]: Token verification and server configuration
//! - [`server`] / [`client`]: WebSocket endpoints

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod ingest;
pub mod membership;
pub mod patch_path;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, IdentityVerifier, MemberListAccess, StaticTokenVerifier, WorkspaceAccess};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{ConfigError, ServerConfig, TokenIdentity};
pub use ingest::{IngestOutcome, Ingestor};
pub use membership::{Departure, Joined, MembershipError, RoomTracker};
pub use patch_path::{
    PatchCoordinator, PatchOutcome, PatchPathError, RateLimiter, RATE_LIMITED,
};
pub use presence::{
    color_for_user, CoordsKind, CursorFrame, PresenceBoard, PresenceEmitter, PresenceEvent,
    Surface, Vec2,
};
pub use protocol::{ErrorCode, PatchAckStatus, ProtocolError, SyncMessage};
pub use registry::{DocState, DocumentRegistry, ReplicatedDocument};
pub use scheduler::{FlushTrigger, PersistenceConfig, PersistenceScheduler};
pub use schema::{SchemaError, SchemaSaved, SchemaService, SharedSchema};
pub use server::{ServerStats, SyncContext, SyncServer};
pub use storage::{
    MemoryStore, PatchDocumentStore, RocksStore, SnapshotRecord, SnapshotStore, StoreConfig,
    StoreError,
};
