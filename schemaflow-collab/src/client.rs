//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, authenticate, join, disconnect)
//! - Update send/receive for mergeable replicas
//! - Patch send with `temp_id` acks for optimistic replicas
//! - Presence frames
//! - Offline queue for updates made while disconnected

use futures_util::{SinkExt, StreamExt};
use schemaflow_core::{ConnectionId, OutgoingPatch, SyncStrategy, WorkspaceId};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::PresenceEvent;
use crate::protocol::{ErrorCode, PatchAckStatus, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Authenticated {
        connection_id: ConnectionId,
        username: String,
    },
    /// Full mergeable state after a join.
    Snapshot {
        workspace_id: WorkspaceId,
        state: Vec<u8>,
        version: u64,
    },
    /// Update merged by another peer.
    RemoteUpdate {
        workspace_id: WorkspaceId,
        update: Vec<u8>,
    },
    /// Answer to a state-vector request.
    Diff {
        workspace_id: WorkspaceId,
        diff: Vec<u8>,
    },
    FullDocument {
        workspace_id: WorkspaceId,
        version: u64,
        content: Value,
    },
    PatchAck {
        workspace_id: WorkspaceId,
        temp_id: String,
        status: PatchAckStatus,
    },
    /// Patch applied by another peer.
    RemotePatch {
        workspace_id: WorkspaceId,
        patches_json: String,
        version: u64,
    },
    Presence(PresenceEvent),
    MemberJoined {
        workspace_id: WorkspaceId,
        username: String,
    },
    MemberLeft {
        workspace_id: WorkspaceId,
        username: String,
    },
    WorkspaceUpdated {
        workspace_id: WorkspaceId,
        schema_id: Option<String>,
        version: Option<u64>,
    },
    ServerError {
        code: ErrorCode,
        message: String,
    },
}

impl SyncEvent {
    fn from_message(msg: SyncMessage) -> Option<SyncEvent> {
        let event = match msg {
            SyncMessage::Authenticated {
                connection_id,
                username,
                ..
            } => SyncEvent::Authenticated {
                connection_id,
                username,
            },
            SyncMessage::FullSnapshot {
                workspace_id,
                state,
                version,
            } => SyncEvent::Snapshot {
                workspace_id,
                state,
                version,
            },
            SyncMessage::Update {
                workspace_id,
                update,
            } => SyncEvent::RemoteUpdate {
                workspace_id,
                update,
            },
            SyncMessage::SyncStep2 { workspace_id, diff } => SyncEvent::Diff { workspace_id, diff },
            SyncMessage::FullDocument {
                workspace_id,
                version,
                content_json,
            } => SyncEvent::FullDocument {
                workspace_id,
                version,
                content: serde_json::from_str(&content_json).ok()?,
            },
            SyncMessage::PatchAck {
                workspace_id,
                temp_id,
                status,
            } => SyncEvent::PatchAck {
                workspace_id,
                temp_id,
                status,
            },
            SyncMessage::Patched {
                workspace_id,
                patches_json,
                version,
                ..
            } => SyncEvent::RemotePatch {
                workspace_id,
                patches_json,
                version,
            },
            SyncMessage::Presence(event) => SyncEvent::Presence(event),
            SyncMessage::MemberJoined {
                workspace_id,
                username,
                ..
            } => SyncEvent::MemberJoined {
                workspace_id,
                username,
            },
            SyncMessage::MemberLeft {
                workspace_id,
                username,
                ..
            } => SyncEvent::MemberLeft {
                workspace_id,
                username,
            },
            SyncMessage::WorkspaceUpdated {
                workspace_id,
                schema_id,
                version,
                ..
            } => SyncEvent::WorkspaceUpdated {
                workspace_id,
                schema_id,
                version,
            },
            SyncMessage::Error { code, message } => SyncEvent::ServerError { code, message },
            _ => return None,
        };
        Some(event)
    }
}

/// Offline queue for updates made while disconnected.
///
/// Queued updates are replayed after the next join.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update; `false` when the queue is full.
    pub fn enqueue(&mut self, update: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(update);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(Vec::len).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    server_url: String,
    token: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Joined workspace and strategy.
    workspace: Arc<RwLock<Option<(WorkspaceId, SyncStrategy)>>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            workspace: Arc::new(RwLock::new(None)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and authenticate.
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::debug!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if let Some(event) = SyncEvent::from_message(sync_msg) {
                                let _ = event_tx.send(event).await;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        self.send(&SyncMessage::Authenticate {
            token: self.token.clone(),
        })
        .await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        Ok(())
    }

    /// Close the connection.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.workspace.write().await = None;
    }

    async fn send(&self, msg: &SyncMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn joined(&self) -> Result<WorkspaceId, ProtocolError> {
        match &*self.workspace.read().await {
            Some((ws, _)) => Ok(ws.clone()),
            None => Err(ProtocolError::Unexpected("not joined to a workspace".into())),
        }
    }

    /// Join a workspace room, replaying queued updates on the merge path.
    pub async fn join(
        &self,
        workspace_id: WorkspaceId,
        strategy: SyncStrategy,
    ) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::Join {
            workspace_id: workspace_id.clone(),
            strategy,
        })
        .await?;
        *self.workspace.write().await = Some((workspace_id.clone(), strategy));

        if strategy == SyncStrategy::Merge {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
            }
            for update in queued {
                self.send(&SyncMessage::Update {
                    workspace_id: workspace_id.clone(),
                    update,
                })
                .await?;
            }
        }
        Ok(())
    }

    pub async fn leave(&self) -> Result<(), ProtocolError> {
        let workspace_id = self.joined().await?;
        *self.workspace.write().await = None;
        self.send(&SyncMessage::Leave { workspace_id }).await
    }

    /// Send a mergeable update. Queued while disconnected or unjoined.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let connected = *self.state.read().await == ConnectionState::Connected;
        let workspace = self.workspace.read().await.clone();
        match workspace {
            Some((workspace_id, _)) if connected => {
                self.send(&SyncMessage::Update {
                    workspace_id,
                    update,
                })
                .await
            }
            _ => {
                if self.offline_queue.lock().await.enqueue(update) {
                    Ok(())
                } else {
                    Err(ProtocolError::ConnectionClosed)
                }
            }
        }
    }

    /// Ask for what the server has beyond `state_vector`.
    pub async fn request_diff(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let workspace_id = self.joined().await?;
        self.send(&SyncMessage::SyncStep1 {
            workspace_id,
            state_vector,
        })
        .await
    }

    /// Send a cursor frame; dropped silently while offline.
    pub async fn send_presence(&self, event: PresenceEvent) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&SyncMessage::Presence(event)).await
    }

    /// Send a patch produced by an `OptimisticReplica`.
    pub async fn send_patch(&self, patch: &OutgoingPatch) -> Result<(), ProtocolError> {
        let workspace_id = self.joined().await?;
        let patches_json = serde_json::to_string(&patch.patches)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.send(&SyncMessage::Patch {
            workspace_id,
            patches_json,
            client_version: patch.base_version,
            temp_id: patch.temp_id.clone(),
        })
        .await
    }

    /// Ask for the authoritative patch document.
    pub async fn request_full(&self) -> Result<(), ProtocolError> {
        let workspace_id = self.joined().await?;
        self.send(&SyncMessage::RequestFull { workspace_id }).await
    }

    pub async fn schema_change(
        &self,
        schema_id: &str,
        name: &str,
        content: &Value,
    ) -> Result<(), ProtocolError> {
        let workspace_id = self.joined().await?;
        self.send(&SyncMessage::SchemaChange {
            workspace_id,
            schema_id: schema_id.to_string(),
            name: name.to_string(),
            content_json: content.to_string(),
        })
        .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::Ping).await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn workspace(&self) -> Option<(WorkspaceId, SyncStrategy)> {
        self.workspace.read().await.clone()
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::CoordsKind;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.offline_queue_len().await, 0);
        assert!(client.workspace().await.is_none());
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        client.send_update(vec![1, 2, 3]).await.unwrap();
        client.send_update(vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);
    }

    #[tokio::test]
    async fn test_presence_offline_noop() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        let event = PresenceEvent {
            user_id: "u1".into(),
            display_name: "alice".into(),
            color: None,
            x: 0.5,
            y: 0.5,
            coords_kind: CoordsKind::Normalized,
            timestamp: 1,
        };
        client.send_presence(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_unjoined_requests_fail() {
        let client = SyncClient::new("ws://localhost:9090", "token");
        assert!(matches!(
            client.request_full().await,
            Err(ProtocolError::Unexpected(_))
        ));
        assert!(client.send_ping().await.is_err());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.is_empty());
        assert!(queue.enqueue(vec![1, 2, 3]));
        assert!(queue.enqueue(vec![4]));
        assert!(queue.enqueue(vec![5]));
        assert!(!queue.enqueue(vec![6]));
        assert_eq!(queue.total_bytes(), 5);

        let drained = queue.drain();
        assert_eq!(drained[0], vec![1, 2, 3]);
        assert!(queue.is_empty());

        queue.enqueue(vec![7]);
        queue.clear();
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_messages_map_to_events() {
        let ws = WorkspaceId::from("W1");
        let event = SyncEvent::from_message(SyncMessage::FullDocument {
            workspace_id: ws.clone(),
            version: 3,
            content_json: r#"{"a":1}"#.into(),
        });
        assert_eq!(
            event,
            Some(SyncEvent::FullDocument {
                workspace_id: ws,
                version: 3,
                content: serde_json::json!({"a": 1}),
            })
        );
        assert_eq!(SyncEvent::from_message(SyncMessage::Pong), None);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090", "token");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
