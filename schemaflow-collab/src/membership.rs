//! Room membership and connection-to-identity tracking.
//!
//! One connection is in at most one room at a time. Every room owns a
//! [`BroadcastGroup`]; the group is dropped with the last member.
//! All maps live behind one `RwLock` so a join, which touches three of
//! them, is observed atomically.

use schemaflow_core::{ConnectionId, Identity, WorkspaceId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::broadcast::{BroadcastGroup, Envelope};
use crate::presence::PresenceEvent;
use crate::protocol::SyncMessage;

/// Channel for frames addressed to one connection.
pub type DirectSender = mpsc::Sender<Arc<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

struct Connection {
    identity: Identity,
    workspace: Option<WorkspaceId>,
    direct: DirectSender,
}

struct Room {
    members: HashSet<ConnectionId>,
    group: Arc<BroadcastGroup>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<WorkspaceId, Room>,
    connections: HashMap<ConnectionId, Connection>,
    users: HashMap<String, HashSet<ConnectionId>>,
}

/// Result of a successful join.
pub struct Joined {
    pub group: Arc<BroadcastGroup>,
    pub receiver: broadcast::Receiver<Envelope>,
    /// Previous room, when the join moved the connection.
    pub left: Option<Departure>,
}

/// A connection left `workspace_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub workspace_id: WorkspaceId,
    /// The room has no members left.
    pub room_empty: bool,
}

/// Tracks which connection is in which room.
pub struct RoomTracker {
    inner: RwLock<Inner>,
    broadcast_capacity: usize,
}

impl RoomTracker {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            broadcast_capacity,
        }
    }

    /// Record an authenticated connection.
    pub async fn register(&self, connection: ConnectionId, identity: Identity, direct: DirectSender) {
        let mut inner = self.inner.write().await;
        inner
            .users
            .entry(identity.username.clone())
            .or_default()
            .insert(connection);
        inner.connections.insert(
            connection,
            Connection {
                identity,
                workspace: None,
                direct,
            },
        );
    }

    /// Put `connection` into the room for `workspace_id`.
    ///
    /// Leaves the previous room first, announcing the departure there.
    /// Joining the room the connection is already in only hands out a
    /// fresh receiver.
    pub async fn join(
        &self,
        connection: ConnectionId,
        workspace_id: &WorkspaceId,
    ) -> Result<Joined, MembershipError> {
        let mut inner = self.inner.write().await;
        let (identity, previous) = match inner.connections.get(&connection) {
            Some(c) => (c.identity.clone(), c.workspace.clone()),
            None => return Err(MembershipError::UnknownConnection(connection)),
        };

        if previous.as_ref() == Some(workspace_id) {
            if let Some(room) = inner.rooms.get(workspace_id) {
                return Ok(Joined {
                    group: room.group.clone(),
                    receiver: room.group.subscribe(),
                    left: None,
                });
            }
        }

        let left = previous.map(|ws| Self::remove_member(&mut *inner, connection, &identity, ws));

        let capacity = self.broadcast_capacity;
        let room = inner
            .rooms
            .entry(workspace_id.clone())
            .or_insert_with(|| Room {
                members: HashSet::new(),
                group: Arc::new(BroadcastGroup::new(capacity)),
            });
        room.members.insert(connection);
        let group = room.group.clone();
        let receiver = group.subscribe();

        if let Some(c) = inner.connections.get_mut(&connection) {
            c.workspace = Some(workspace_id.clone());
        }

        let announce = SyncMessage::MemberJoined {
            workspace_id: workspace_id.clone(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
        };
        if let Err(e) = group.send(Some(connection), &announce) {
            log::debug!("Failed to announce {} in {workspace_id}: {e}", identity.username);
        }
        log::info!("{} ({connection}) joined workspace {workspace_id}", identity.username);

        Ok(Joined {
            group,
            receiver,
            left,
        })
    }

    /// Take `connection` out of its room, if any.
    pub async fn leave(&self, connection: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        let (identity, workspace) = {
            let c = inner.connections.get_mut(&connection)?;
            (c.identity.clone(), c.workspace.take()?)
        };
        Some(Self::remove_member(&mut *inner, connection, &identity, workspace))
    }

    /// Forget a connection entirely (disconnect).
    pub async fn unregister(&self, connection: ConnectionId) -> Option<Departure> {
        let mut inner = self.inner.write().await;
        let c = inner.connections.remove(&connection)?;
        if let Some(set) = inner.users.get_mut(&c.identity.username) {
            set.remove(&connection);
            if set.is_empty() {
                inner.users.remove(&c.identity.username);
            }
        }
        c.workspace
            .map(|ws| Self::remove_member(&mut *inner, connection, &c.identity, ws))
    }

    fn remove_member(
        inner: &mut Inner,
        connection: ConnectionId,
        identity: &Identity,
        workspace_id: WorkspaceId,
    ) -> Departure {
        let mut room_empty = true;
        if let Some(room) = inner.rooms.get_mut(&workspace_id) {
            room.members.remove(&connection);
            room_empty = room.members.is_empty();
            if room_empty {
                inner.rooms.remove(&workspace_id);
            } else {
                let announce = SyncMessage::MemberLeft {
                    workspace_id: workspace_id.clone(),
                    user_id: identity.user_id.clone(),
                    username: identity.username.clone(),
                };
                if let Err(e) = room.group.send(Some(connection), &announce) {
                    log::debug!("Failed to announce departure in {workspace_id}: {e}");
                }
            }
        }
        log::info!("{} ({connection}) left workspace {workspace_id}", identity.username);
        Departure {
            workspace_id,
            room_empty,
        }
    }

    /// Relay a presence frame to the other members of the sender's room.
    ///
    /// The frame is stamped with the sender's verified identity. Returns the
    /// number of other members addressed; an unjoined sender reaches nobody.
    pub async fn relay_presence(&self, connection: ConnectionId, mut event: PresenceEvent) -> usize {
        let inner = self.inner.read().await;
        let Some(c) = inner.connections.get(&connection) else {
            log::debug!("Dropping presence from unknown connection {connection}");
            return 0;
        };
        let Some(room) = c.workspace.as_ref().and_then(|ws| inner.rooms.get(ws)) else {
            log::debug!("Dropping presence from {connection}: not in a room");
            return 0;
        };

        event.user_id = c.identity.user_id.clone();
        event.display_name = c.identity.username.clone();
        log::trace!("Presence from {connection} at ({}, {})", event.x, event.y);

        match room.group.send(Some(connection), &SyncMessage::Presence(event)) {
            Ok(_) => room.members.len().saturating_sub(1),
            Err(e) => {
                log::debug!("Failed to encode presence from {connection}: {e}");
                0
            }
        }
    }

    /// Send `message` to every connection of `username`. Returns deliveries.
    pub async fn notify_user(&self, username: &str, message: &SyncMessage) -> usize {
        let frame = match message.encode() {
            Ok(f) => Arc::new(f),
            Err(e) => {
                log::debug!("Failed to encode notification for {username}: {e}");
                return 0;
            }
        };
        let inner = self.inner.read().await;
        let Some(ids) = inner.users.get(username) else {
            log::debug!("No connections for {username}; notification dropped");
            return 0;
        };
        let mut delivered = 0;
        for id in ids {
            if let Some(c) = inner.connections.get(id) {
                match c.direct.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => log::debug!("Direct send to {id} failed: {e}"),
                }
            }
        }
        delivered
    }

    /// Broadcast group of a workspace with at least one member.
    pub async fn room(&self, workspace_id: &WorkspaceId) -> Option<Arc<BroadcastGroup>> {
        self.inner
            .read()
            .await
            .rooms
            .get(workspace_id)
            .map(|r| r.group.clone())
    }

    pub async fn members(&self, workspace_id: &WorkspaceId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(workspace_id)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_room_empty(&self, workspace_id: &WorkspaceId) -> bool {
        !self.inner.read().await.rooms.contains_key(workspace_id)
    }

    pub async fn workspace_of(&self, connection: ConnectionId) -> Option<WorkspaceId> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection)
            .and_then(|c| c.workspace.clone())
    }

    pub async fn identity_of(&self, connection: ConnectionId) -> Option<Identity> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection)
            .map(|c| c.identity.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}
