//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── DocumentRegistry ── ReplicatedDocument (Yrs)
//!             ├── connection task ──┤         │
//! Client B ──┘   (one per socket)   │   PersistenceScheduler ── SnapshotStore
//!                                   ├── RoomTracker ── BroadcastGroup per room
//!                                   └── PatchCoordinator ── PatchDocumentStore
//! ```
//!
//! Every connection authenticates, joins one workspace room with a sync
//! strategy, and then either streams mergeable updates or JSON patches.
//! Presence frames only ever touch the room tracker.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use schemaflow_core::{
    parse_patches, ConnectionId, Identity, MergeableState, SyncStrategy, WorkspaceId, YrsState,
};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{IdentityVerifier, MemberListAccess, StaticTokenVerifier, WorkspaceAccess};
use crate::broadcast::{BroadcastGroup, Envelope};
use crate::config::ServerConfig;
use crate::ingest::Ingestor;
use crate::membership::{DirectSender, RoomTracker};
use crate::patch_path::{
    PatchCoordinator, PatchOutcome, PatchPathError, RateLimiter, RATE_LIMITED,
};
use crate::protocol::{ErrorCode, PatchAckStatus, SyncMessage};
use crate::registry::DocumentRegistry;
use crate::scheduler::PersistenceScheduler;
use crate::schema::{SchemaError, SchemaSaved, SchemaService};
use crate::storage::{MemoryStore, PatchDocumentStore, RocksStore, SnapshotStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub resident_documents: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Everything a connection needs, built once per server.
pub struct SyncContext {
    pub config: ServerConfig,
    pub registry: Arc<DocumentRegistry<YrsState>>,
    pub tracker: Arc<RoomTracker>,
    pub scheduler: PersistenceScheduler,
    pub ingest: Ingestor<YrsState>,
    pub patches: PatchCoordinator,
    pub schemas: SchemaService<YrsState>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub access: Arc<dyn WorkspaceAccess>,
    counters: Counters,
}

impl SyncContext {
    pub fn new(
        config: ServerConfig,
        snapshots: Arc<dyn SnapshotStore>,
        documents: Arc<dyn PatchDocumentStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = Arc::new(DocumentRegistry::new(snapshots.clone()));
        let tracker = Arc::new(RoomTracker::new(config.broadcast_capacity));
        let scheduler = PersistenceScheduler::new(snapshots, config.persistence.clone());
        let access = Arc::new(MemberListAccess::from_table(&config.workspace_members));
        Self {
            ingest: Ingestor::new(registry.clone(), tracker.clone(), scheduler.clone()),
            patches: PatchCoordinator::new(documents, tracker.clone()),
            schemas: SchemaService::new(registry.clone(), tracker.clone(), scheduler.clone()),
            registry,
            tracker,
            scheduler,
            verifier,
            access,
            config,
            counters: Counters::default(),
        }
    }

    /// Replace the configured member lists with another access policy.
    pub fn with_access(mut self, access: Arc<dyn WorkspaceAccess>) -> Self {
        self.access = access;
        self
    }

    /// Open the configured store (RocksDB, or memory without a path) and
    /// accept the configured tokens.
    pub fn from_config(config: ServerConfig) -> Result<Self, StoreError> {
        let verifier = Arc::new(StaticTokenVerifier::from_table(&config.tokens));
        match &config.storage_path {
            Some(path) => {
                let store = Arc::new(RocksStore::open(StoreConfig::at(path.clone()))?);
                log::info!("Using RocksDB storage at {}", path.display());
                Ok(Self::new(config, store.clone(), store, verifier))
            }
            None => {
                log::info!("No storage path configured, documents are kept in memory");
                let store = Arc::new(MemoryStore::new());
                Ok(Self::new(config, store.clone(), store, verifier))
            }
        }
    }

    /// Full state and version for a joining replica.
    ///
    /// Retries when the document was evicted between lookup and lock.
    pub async fn snapshot_for_join(&self, workspace_id: &WorkspaceId) -> (Vec<u8>, u64) {
        loop {
            let doc = self.registry.get_or_create(workspace_id).await;
            let st = doc.lock().await;
            if st.is_evicted() {
                continue;
            }
            return (st.state.encode(), st.version);
        }
    }

    /// Whole authoritative state in the form `strategy` clients consume.
    /// Sent on join and again when a connection fell behind its room.
    pub async fn full_state(&self, workspace_id: WorkspaceId, strategy: SyncStrategy) -> SyncMessage {
        match strategy {
            SyncStrategy::Merge => {
                let (state, version) = self.snapshot_for_join(&workspace_id).await;
                SyncMessage::FullSnapshot {
                    workspace_id,
                    state,
                    version,
                }
            }
            SyncStrategy::Patch => self.full_document(workspace_id).await,
        }
    }

    pub async fn full_document(&self, workspace_id: WorkspaceId) -> SyncMessage {
        match self.patches.fetch_full(&workspace_id).await {
            Ok(doc) => SyncMessage::FullDocument {
                workspace_id,
                version: doc.version,
                content_json: doc.content.to_string(),
            },
            Err(e) => {
                log::error!("Failed to load patch document {workspace_id}: {e}");
                SyncMessage::error(ErrorCode::Internal, e.to_string())
            }
        }
    }

    /// Save a shared schema from outside any connection.
    pub async fn save_schema(
        &self,
        workspace_id: &WorkspaceId,
        schema_id: &str,
        name: &str,
        content: Value,
    ) -> Result<SchemaSaved, SchemaError> {
        self.schemas
            .update_shared_schema(workspace_id, schema_id, name, content, None)
            .await
    }

    /// Send `message` to every connection of `username`.
    pub async fn notify_user(&self, username: &str, message: &SyncMessage) -> usize {
        self.tracker.notify_user(username, message).await
    }

    /// Flush and evict a workspace whose room emptied.
    pub async fn release_workspace(&self, workspace_id: &WorkspaceId) -> bool {
        self.registry
            .release(workspace_id, &self.scheduler, &self.tracker)
            .await
    }

    fn spawn_release(self: &Arc<Self>, workspace_id: WorkspaceId) {
        let ctx = self.clone();
        tokio::spawn(async move {
            ctx.release_workspace(&workspace_id).await;
        });
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.tracker.room_count().await,
            resident_documents: self.registry.resident_count().await,
        }
    }
}

/// The sync server.
pub struct SyncServer {
    context: Arc<SyncContext>,
}

impl SyncServer {
    /// Server for `config`, opening its store.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        Ok(Self::with_context(Arc::new(SyncContext::from_config(config)?)))
    }

    pub fn with_context(context: Arc<SyncContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    pub fn bind_addr(&self) -> &str {
        &self.context.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.context.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.context.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.context.stats().await
    }
}

enum Flow {
    Continue,
    Close,
}

struct JoinedRoom {
    workspace_id: WorkspaceId,
    strategy: SyncStrategy,
    group: Arc<BroadcastGroup>,
    receiver: broadcast::Receiver<Envelope>,
}

struct Session {
    id: ConnectionId,
    addr: SocketAddr,
    ctx: Arc<SyncContext>,
    identity: Option<Identity>,
    direct_tx: DirectSender,
    room: Option<JoinedRoom>,
    limiter: RateLimiter,
}

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SyncContext>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (direct_tx, mut direct_rx) = mpsc::channel(ctx.config.direct_capacity.max(1));
    let mut session = Session {
        id: ConnectionId::new(),
        addr,
        identity: None,
        direct_tx,
        room: None,
        limiter: RateLimiter::per_second(ctx.config.max_patches_per_sec),
        ctx: ctx.clone(),
    };
    log::info!("WebSocket connection {} established from {addr}", session.id);

    ctx.counters.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.counters.active_connections.fetch_add(1, Ordering::Relaxed);

    let heartbeat = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);

    let result = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        ctx.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                        ctx.counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match SyncMessage::decode(&data) {
                            Ok(sync_msg) => match session.handle(&mut ws_sender, sync_msg).await {
                                Ok(Flow::Continue) => {}
                                Ok(Flow::Close) => break Ok(()),
                                Err(e) => break Err(e),
                            },
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                let reply = SyncMessage::error(ErrorCode::Malformed, e.to_string());
                                if let Err(e) = send(&mut ws_sender, &reply).await {
                                    break Err(e);
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {} closed from {addr}", session.id);
                        break Ok(());
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }

            env = async {
                match session.room.as_mut() {
                    Some(room) => room.receiver.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match env {
                    Ok(env) => {
                        if !env.is_for(session.id) {
                            continue;
                        }
                        if let Err(e) = ws_sender.send(Message::Binary(env.frame.as_ref().clone().into())).await {
                            break Err(e.into());
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if let Some(room) = &session.room {
                            room.group.record_lagged(n);
                            log::warn!("Connection {} lagged by {n} frames in {}, resyncing", session.id, room.workspace_id);
                        }
                        if let Err(e) = session.resync(&mut ws_sender).await {
                            break Err(e);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        session.room = None;
                    }
                }
            }

            frame = direct_rx.recv() => {
                if let Some(frame) = frame {
                    if let Err(e) = ws_sender.send(Message::Binary(frame.as_ref().clone().into())).await {
                        break Err(e.into());
                    }
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                    break Err(e.into());
                }
            }
        }
    };

    // A disconnect never cancels a pending flush; release flushes first.
    if session.identity.is_some() {
        if let Some(departure) = ctx.tracker.unregister(session.id).await {
            if departure.room_empty {
                ctx.release_workspace(&departure.workspace_id).await;
            }
        }
    }
    ctx.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

impl Session {
    async fn handle(&mut self, sink: &mut WsSink, msg: SyncMessage) -> Result<Flow, BoxError> {
        match msg {
            SyncMessage::Authenticate { token } => return self.authenticate(sink, &token).await,
            SyncMessage::Ping => {
                send(sink, &SyncMessage::Pong).await?;
                return Ok(Flow::Continue);
            }
            _ if self.identity.is_none() => {
                let reply = SyncMessage::error(ErrorCode::Unauthenticated, "authenticate first");
                send(sink, &reply).await?;
                return Ok(Flow::Continue);
            }
            _ => {}
        }

        match msg {
            SyncMessage::Join {
                workspace_id,
                strategy,
            } => self.join(sink, workspace_id, strategy).await?,

            SyncMessage::Leave { workspace_id } => {
                if self.check_room(sink, &workspace_id, None).await? {
                    self.leave().await;
                }
            }

            SyncMessage::Update {
                workspace_id,
                update,
            }
            | SyncMessage::SyncStep2 {
                workspace_id,
                diff: update,
            } => {
                if self.check_room(sink, &workspace_id, Some(SyncStrategy::Merge)).await? {
                    self.ctx.ingest.apply_update(&workspace_id, &update, self.id).await;
                }
            }

            SyncMessage::SyncStep1 {
                workspace_id,
                state_vector,
            } => {
                if self.check_room(sink, &workspace_id, Some(SyncStrategy::Merge)).await? {
                    self.sync_step1(sink, workspace_id, &state_vector).await?;
                }
            }

            SyncMessage::SchemaChange {
                workspace_id,
                schema_id,
                name,
                content_json,
            } => {
                if self.check_room(sink, &workspace_id, None).await? {
                    self.schema_change(sink, workspace_id, &schema_id, &name, &content_json)
                        .await?;
                }
            }

            SyncMessage::Patch {
                workspace_id,
                patches_json,
                client_version,
                temp_id,
            } => {
                if self.check_room(sink, &workspace_id, Some(SyncStrategy::Patch)).await? {
                    let status = self
                        .patch(&workspace_id, &patches_json, client_version, &temp_id)
                        .await;
                    let ack = SyncMessage::PatchAck {
                        workspace_id,
                        temp_id,
                        status,
                    };
                    send(sink, &ack).await?;
                }
            }

            SyncMessage::RequestFull { workspace_id } => {
                if self.check_room(sink, &workspace_id, None).await? {
                    let reply = self.ctx.full_document(workspace_id).await;
                    send(sink, &reply).await?;
                }
            }

            SyncMessage::Presence(event) => {
                self.ctx.tracker.relay_presence(self.id, event).await;
            }

            SyncMessage::Pong => {}

            _ => {
                log::debug!("Ignoring server-to-client message sent by {}", self.addr);
            }
        }
        Ok(Flow::Continue)
    }

    async fn authenticate(&mut self, sink: &mut WsSink, token: &str) -> Result<Flow, BoxError> {
        if self.identity.is_some() {
            log::debug!("Connection {} authenticated twice", self.id);
            return Ok(Flow::Continue);
        }
        match self.ctx.verifier.verify(token) {
            Ok(identity) => {
                self.ctx
                    .tracker
                    .register(self.id, identity.clone(), self.direct_tx.clone())
                    .await;
                let reply = SyncMessage::Authenticated {
                    connection_id: self.id,
                    user_id: identity.user_id.clone(),
                    username: identity.username.clone(),
                };
                log::info!("Connection {} authenticated as {}", self.id, identity.username);
                self.identity = Some(identity);
                send(sink, &reply).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                log::info!("Authentication failed from {}: {e}", self.addr);
                send(sink, &SyncMessage::error(ErrorCode::AuthFailed, e.to_string())).await?;
                Ok(Flow::Close)
            }
        }
    }

    /// Whether the connection is in `workspace_id` with a fitting strategy.
    /// Replies with an error when it is not.
    async fn check_room(
        &self,
        sink: &mut WsSink,
        workspace_id: &WorkspaceId,
        strategy: Option<SyncStrategy>,
    ) -> Result<bool, BoxError> {
        let error = match &self.room {
            Some(room) if &room.workspace_id != workspace_id => Some((
                ErrorCode::NotJoined,
                format!("not joined to {workspace_id}"),
            )),
            Some(room) => match strategy {
                Some(expected) if expected != room.strategy => Some((
                    ErrorCode::WrongStrategy,
                    format!("joined with {} sync", room.strategy),
                )),
                _ => None,
            },
            None => Some((ErrorCode::NotJoined, "join a workspace first".to_string())),
        };
        match error {
            Some((code, message)) => {
                log::debug!("Dropping message from {}: {message}", self.id);
                send(sink, &SyncMessage::error(code, message)).await?;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn join(
        &mut self,
        sink: &mut WsSink,
        workspace_id: WorkspaceId,
        strategy: SyncStrategy,
    ) -> Result<(), BoxError> {
        let allowed = self
            .identity
            .as_ref()
            .is_some_and(|identity| self.ctx.access.can_join(identity, &workspace_id));
        if !allowed {
            log::info!("Connection {} refused entry to {workspace_id}", self.id);
            let reply = SyncMessage::error(ErrorCode::Forbidden, format!("not a member of {workspace_id}"));
            return send(sink, &reply).await;
        }

        let joined = match self.ctx.tracker.join(self.id, &workspace_id).await {
            Ok(joined) => joined,
            Err(e) => {
                send(sink, &SyncMessage::error(ErrorCode::Internal, e.to_string())).await?;
                return Ok(());
            }
        };
        if let Some(left) = joined.left {
            if left.room_empty {
                self.ctx.spawn_release(left.workspace_id);
            }
        }

        // Subscribed before the snapshot is taken, so nothing merged after
        // it can be missed.
        self.room = Some(JoinedRoom {
            workspace_id: workspace_id.clone(),
            strategy,
            group: joined.group,
            receiver: joined.receiver,
        });

        let reply = self.ctx.full_state(workspace_id, strategy).await;
        send(sink, &reply).await
    }

    async fn leave(&mut self) {
        self.room = None;
        if let Some(departure) = self.ctx.tracker.leave(self.id).await {
            if departure.room_empty {
                self.ctx.spawn_release(departure.workspace_id);
            }
        }
    }

    async fn sync_step1(
        &self,
        sink: &mut WsSink,
        workspace_id: WorkspaceId,
        state_vector: &[u8],
    ) -> Result<(), BoxError> {
        let doc = self.ctx.registry.get_or_create(&workspace_id).await;
        let diff = {
            let st = doc.lock().await;
            st.state.encode_diff(state_vector)
        };
        let reply = match diff {
            Ok(diff) => SyncMessage::SyncStep2 { workspace_id, diff },
            Err(e) => {
                log::debug!("Bad state vector from {}: {e}", self.id);
                SyncMessage::error(ErrorCode::Malformed, e.to_string())
            }
        };
        send(sink, &reply).await
    }

    async fn schema_change(
        &self,
        sink: &mut WsSink,
        workspace_id: WorkspaceId,
        schema_id: &str,
        name: &str,
        content_json: &str,
    ) -> Result<(), BoxError> {
        let content: Value = match serde_json::from_str(content_json) {
            Ok(content) => content,
            Err(e) => {
                send(sink, &SyncMessage::error(ErrorCode::Malformed, e.to_string())).await?;
                return Ok(());
            }
        };
        if let Err(e) = self
            .ctx
            .schemas
            .update_shared_schema(&workspace_id, schema_id, name, content, Some(self.id))
            .await
        {
            log::warn!("Schema change {schema_id} in {workspace_id} failed: {e}");
            send(sink, &SyncMessage::error(ErrorCode::Internal, e.to_string())).await?;
        }
        Ok(())
    }

    async fn patch(
        &mut self,
        workspace_id: &WorkspaceId,
        patches_json: &str,
        client_version: u64,
        temp_id: &str,
    ) -> PatchAckStatus {
        if !self.limiter.check() {
            log::debug!("Rate limited patch {temp_id} from {}", self.id);
            return PatchAckStatus::Rejected {
                reason: RATE_LIMITED.to_string(),
            };
        }
        let patches = match parse_patches(patches_json) {
            Ok(patches) => patches,
            Err(e) => {
                return PatchAckStatus::Rejected {
                    reason: e.to_string(),
                }
            }
        };
        match self
            .ctx
            .patches
            .apply_patch(workspace_id, &patches, client_version, self.id, temp_id)
            .await
        {
            Ok(PatchOutcome::Applied { version }) => PatchAckStatus::Applied { version },
            Ok(PatchOutcome::Conflict {
                server_version,
                content,
            }) => PatchAckStatus::Conflict {
                server_version,
                content_json: content.to_string(),
            },
            Err(PatchPathError::InvalidPatch(reason)) => PatchAckStatus::Rejected { reason },
            Err(PatchPathError::Store(e)) => {
                log::error!("Patch {temp_id} on {workspace_id} failed: {e}");
                PatchAckStatus::Rejected {
                    reason: "storage unavailable".to_string(),
                }
            }
        }
    }

    /// Resend the whole room state after frames were dropped.
    async fn resync(&self, sink: &mut WsSink) -> Result<(), BoxError> {
        let Some(room) = &self.room else {
            return Ok(());
        };
        let reply = self
            .ctx
            .full_state(room.workspace_id.clone(), room.strategy)
            .await;
        send(sink, &reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_context(config: ServerConfig) -> Arc<SyncContext> {
        Arc::new(SyncContext::from_config(config).unwrap())
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::with_storage("127.0.0.1:0", dir.path().join("db"));
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_snapshot_for_join_hydrates() {
        let ctx = memory_context(ServerConfig::default());
        let ws = WorkspaceId::from("W1");
        let (state, version) = ctx.snapshot_for_join(&ws).await;
        assert_eq!(version, 0);
        assert!(!state.is_empty());
        assert_eq!(ctx.stats().await.resident_documents, 1);
    }

    fn text_update(insert: &str) -> Vec<u8> {
        use yrs::{Doc, ReadTxn, Text, Transact, WriteTxn};
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, 0, insert);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&yrs::StateVector::default())
    }

    fn text_of(state: &[u8]) -> String {
        use yrs::updates::decoder::Decode;
        use yrs::{Doc, GetString, Transact};
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(yrs::Update::decode_v1(state).unwrap())
                .unwrap();
        }
        let txn = doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_lagged_member_resyncs_from_full_state() {
        let mut config = ServerConfig::default();
        config.broadcast_capacity = 1;
        let ctx = memory_context(config);
        let ws = WorkspaceId::from("W1");

        let bob = ConnectionId::new();
        let (direct_tx, _direct_rx) = mpsc::channel(4);
        ctx.tracker
            .register(bob, Identity::new("u-b", "bob"), direct_tx)
            .await;
        let mut receiver = ctx.tracker.join(bob, &ws).await.unwrap().receiver;

        let alice = ConnectionId::new();
        for text in ["a", "b", "c", "d"] {
            ctx.ingest.apply_update(&ws, &text_update(text), alice).await;
        }
        assert!(matches!(
            receiver.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        match ctx.full_state(ws.clone(), SyncStrategy::Merge).await {
            SyncMessage::FullSnapshot { state, .. } => {
                let text = text_of(&state);
                assert_eq!(text.len(), 4);
                for c in ["a", "b", "c", "d"] {
                    assert!(text.contains(c), "{c} missing from {text}");
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        match ctx.full_state(ws, SyncStrategy::Patch).await {
            SyncMessage::FullDocument { version, .. } => assert_eq!(version, 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_after_schema_save() {
        let ctx = memory_context(ServerConfig::default());
        let ws = WorkspaceId::from("W1");
        let saved = ctx
            .save_schema(&ws, "s1", "Schema", json!({"tables": []}))
            .await
            .unwrap();
        assert_eq!(saved.version, 1);

        assert!(ctx.release_workspace(&ws).await);
        assert_eq!(ctx.registry.resident_count().await, 0);

        let restored = ctx.schemas.shared_schema(&ws, "s1").await.unwrap();
        assert_eq!(restored.content, json!({"tables": []}));
    }
}
