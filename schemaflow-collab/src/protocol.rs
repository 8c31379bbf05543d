//! Binary wire protocol between sync clients and the server.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`SyncMessage`].
//! Mergeable updates travel as opaque bytes; JSON values (patches, patch
//! documents, schema content) travel as JSON text inside the frame.

use schemaflow_core::{ConnectionId, SyncStrategy, WorkspaceId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::PresenceEvent;

/// Outcome carried by a [`SyncMessage::PatchAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchAckStatus {
    /// Patch stored at `version`.
    Applied { version: u64 },
    /// Client's base version was stale; authoritative copy attached.
    Conflict {
        server_version: u64,
        content_json: String,
    },
    /// Patch refused without touching the document.
    Rejected { reason: String },
}

/// Machine-readable error kinds sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Unauthenticated,
    AuthFailed,
    /// Workspace is private and the identity is not a member.
    Forbidden,
    NotJoined,
    WrongStrategy,
    Malformed,
    Internal,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    // ── Session ──────────────────────────────────────────────
    /// First message of every connection.
    Authenticate { token: String },
    Authenticated {
        connection_id: ConnectionId,
        user_id: String,
        username: String,
    },
    /// Enter a workspace room; leaves any previous room.
    Join {
        workspace_id: WorkspaceId,
        strategy: SyncStrategy,
    },
    Leave { workspace_id: WorkspaceId },

    // ── Merge path ───────────────────────────────────────────
    /// Full state for a joining replica.
    FullSnapshot {
        workspace_id: WorkspaceId,
        state: Vec<u8>,
        version: u64,
    },
    /// Incremental mergeable update.
    Update {
        workspace_id: WorkspaceId,
        update: Vec<u8>,
    },
    /// State vector; the peer answers with `SyncStep2`.
    SyncStep1 {
        workspace_id: WorkspaceId,
        state_vector: Vec<u8>,
    },
    SyncStep2 {
        workspace_id: WorkspaceId,
        diff: Vec<u8>,
    },
    /// Whole named schema written through the replicated document.
    SchemaChange {
        workspace_id: WorkspaceId,
        schema_id: String,
        name: String,
        content_json: String,
    },

    // ── Patch path ───────────────────────────────────────────
    Patch {
        workspace_id: WorkspaceId,
        patches_json: String,
        client_version: u64,
        temp_id: String,
    },
    PatchAck {
        workspace_id: WorkspaceId,
        temp_id: String,
        status: PatchAckStatus,
    },
    /// Another client's patch, now stored at `version`.
    Patched {
        workspace_id: WorkspaceId,
        patches_json: String,
        version: u64,
        origin: ConnectionId,
        temp_id: String,
    },
    RequestFull { workspace_id: WorkspaceId },
    FullDocument {
        workspace_id: WorkspaceId,
        version: u64,
        content_json: String,
    },

    // ── Room ─────────────────────────────────────────────────
    Presence(PresenceEvent),
    MemberJoined {
        workspace_id: WorkspaceId,
        user_id: String,
        username: String,
    },
    MemberLeft {
        workspace_id: WorkspaceId,
        user_id: String,
        username: String,
    },
    /// Something in the workspace was saved.
    WorkspaceUpdated {
        workspace_id: WorkspaceId,
        schema_id: Option<String>,
        version: Option<u64>,
        last_modified: u64,
    },

    Error { code: ErrorCode, message: String },
    Ping,
    Pong,
}

impl SyncMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        SyncMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Workspace this message addresses, if any.
    pub fn workspace_id(&self) -> Option<&WorkspaceId> {
        match self {
            SyncMessage::Join { workspace_id, .. }
            | SyncMessage::Leave { workspace_id }
            | SyncMessage::FullSnapshot { workspace_id, .. }
            | SyncMessage::Update { workspace_id, .. }
            | SyncMessage::SyncStep1 { workspace_id, .. }
            | SyncMessage::SyncStep2 { workspace_id, .. }
            | SyncMessage::SchemaChange { workspace_id, .. }
            | SyncMessage::Patch { workspace_id, .. }
            | SyncMessage::PatchAck { workspace_id, .. }
            | SyncMessage::Patched { workspace_id, .. }
            | SyncMessage::RequestFull { workspace_id }
            | SyncMessage::FullDocument { workspace_id, .. }
            | SyncMessage::MemberJoined { workspace_id, .. }
            | SyncMessage::MemberLeft { workspace_id, .. }
            | SyncMessage::WorkspaceUpdated { workspace_id, .. } => Some(workspace_id),
            _ => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message: {0}")]
    Unexpected(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
