//! Channel fan-out with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all members of a channel.
//! Each member gets an independent receiver that buffers up to `capacity`
//! messages; a member that falls further behind loses the oldest messages
//! and is expected to recover through the resync handshake.
//!
//! Both the in-process [`LocalHub`](crate::transport::local::LocalHub) and
//! the WebSocket [`HubServer`](crate::hub::HubServer) route through these
//! groups. Every envelope records which member sent it so forwarders can
//! skip the sender.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Identifier of one member within a [`BroadcastGroup`].
pub type MemberId = u64;

/// A payload tagged with the member that sent it.
#[derive(Debug)]
pub struct Envelope<T> {
    pub from: MemberId,
    pub payload: Arc<T>,
}

impl<T> Clone for Envelope<T> {
    fn clone(&self) -> Self {
        Self {
            from: self.from,
            payload: Arc::clone(&self.payload),
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_members: usize,
}

/// Atomic broadcast stats, lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single channel.
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<Envelope<T>>,
    members: RwLock<HashSet<MemberId>>,
    next_member: AtomicU64,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl<T: Send + Sync + 'static> BroadcastGroup<T> {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: RwLock::new(HashSet::new()),
            next_member: AtomicU64::new(1),
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    /// Join the group. Returns the new member id and its receiver.
    pub async fn join(&self) -> (MemberId, broadcast::Receiver<Envelope<T>>) {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        self.members.write().await.insert(id);
        (id, self.sender.subscribe())
    }

    /// Leave the group. Returns `false` if `id` was not a member.
    pub async fn leave(&self, id: MemberId) -> bool {
        self.members.write().await.remove(&id)
    }

    /// Send `payload` to every receiver, the sender's own included.
    ///
    /// Returns the number of receivers. Filtering the sender is the
    /// forwarder's job (see [`Envelope::from`]).
    pub fn broadcast(&self, from: MemberId, payload: Arc<T>) -> usize {
        let count = self.sender.send(Envelope { from, payload }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_member(&self, id: MemberId) -> bool {
        self.members.read().await.contains(&id)
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps channel names to broadcast groups.
///
/// Each channel gets its own broadcast group so that messages are isolated
/// between documents.
pub struct RoomManager<T> {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup<T>>>>,
    default_capacity: usize,
}

impl<T: Send + Sync + 'static> RoomManager<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `channel`.
    pub async fn get_or_create(&self, channel: &str) -> Arc<BroadcastGroup<T>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(channel) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(channel) {
            return room.clone();
        }

        let room = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(channel.to_string(), room.clone());
        room
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<BroadcastGroup<T>>> {
        self.rooms.read().await.get(channel).cloned()
    }

    /// Remove the group for `channel` if nobody is in it.
    pub async fn remove_if_empty(&self, channel: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(channel) {
            if room.member_count().await == 0 {
                rooms.remove(channel);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn channels(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
