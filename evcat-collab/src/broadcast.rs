//! Fan-out of frames to the channels attached to one room.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber and
//! each subscriber buffers up to `capacity` frames. Every frame carries the
//! id of the channel it came from so a receiver can skip its own frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify, RwLock};
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// An encoded frame and the channel it originated from.
///
/// `from` is nil for frames produced by the room itself.
#[derive(Debug, Clone)]
pub struct Fanout {
    pub from: Uuid,
    pub frame: Arc<Vec<u8>>,
}

/// Bookkeeping for one attached channel.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: Uuid,
    pub joined_at: Instant,
    kick: Arc<Notify>,
}

impl PeerHandle {
    /// Resolves once the peer has been detached from outside its serve loop.
    pub async fn kicked(&self) {
        self.kick.notified().await
    }
}

/// The channels attached to a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Fanout>,
    peers: RwLock<HashMap<Uuid, PeerHandle>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a slow channel may lag before it starts
    /// losing frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer. Returns its handle and a receiver of room frames.
    pub async fn add_peer(&self, peer_id: Uuid) -> (PeerHandle, broadcast::Receiver<Fanout>) {
        let handle = PeerHandle {
            peer_id,
            joined_at: Instant::now(),
            kick: Arc::new(Notify::new()),
        };
        let mut peers = self.peers.write().await;
        peers.insert(peer_id, handle.clone());
        (handle, self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerHandle> {
        self.peers.write().await.remove(peer_id)
    }

    /// Remove a peer and wake its serve loop so it stops.
    pub async fn kick_peer(&self, peer_id: &Uuid) -> bool {
        match self.remove_peer(peer_id).await {
            Some(handle) => {
                handle.kick.notify_one();
                true
            }
            None => false,
        }
    }

    /// Send an encoded frame to every subscriber. Returns the receiver count.
    pub fn broadcast(&self, from: Uuid, frame: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Fanout {
                from,
                frame: Arc::new(frame),
            })
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
