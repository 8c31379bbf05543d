//! Fan-out of encoded frames to the members of one room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, each
//! with an independent buffer of `capacity` frames. Frames carry the
//! connection that produced them so receivers can skip their own.

use schemaflow_core::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, SyncMessage};

/// One encoded frame plus the connection that produced it.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// `None` for server-originated frames, delivered to everyone.
    pub origin: Option<ConnectionId>,
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    /// Whether `connection` should receive this frame.
    pub fn is_for(&self, connection: ConnectionId) -> bool {
        self.origin != Some(connection)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_receivers: usize,
}

/// Broadcast group for a single workspace room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Encode and send `msg`. Returns the number of receivers reached.
    pub fn send(
        &self,
        origin: Option<ConnectionId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.send_raw(origin, frame))
    }

    /// Send a pre-encoded frame.
    pub fn send_raw(&self, origin: Option<ConnectionId>, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { origin, frame }).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_lagged(&self, skipped: u64) {
        self.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_receivers: self.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_carries_origin() {
        let group = BroadcastGroup::new(16);
        let alice = ConnectionId::new();
        let bob = ConnectionId::new();

        let mut rx_a = group.subscribe();
        let mut rx_b = group.subscribe();

        let count = group.send(Some(alice), &SyncMessage::Ping).unwrap();
        assert_eq!(count, 2);

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert!(!got_a.is_for(alice));
        assert!(got_b.is_for(bob));
        assert_eq!(SyncMessage::decode(&got_b.frame).unwrap(), SyncMessage::Ping);
    }

    #[tokio::test]
    async fn test_server_frames_reach_everyone() {
        let group = BroadcastGroup::new(4);
        let mut rx = group.subscribe();
        group.send_raw(None, Arc::new(vec![1, 2, 3]));
        let env = rx.recv().await.unwrap();
        assert!(env.is_for(ConnectionId::new()));
        assert_eq!(*env.frame, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_without_receivers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.send_raw(None, Arc::new(vec![0])), 0);
        assert_eq!(group.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.send_raw(None, Arc::new(vec![i]));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_lagged(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats();
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_receivers, 1);
    }
}
