//! In-process broadcast transport.
//!
//! [`LocalHub`] fans messages out between subscriptions living in the same
//! process. It never echoes a message back to the subscription that sent it.
//! Faults can be injected for tests and demos:
//!
//! - [`LocalHub::set_online`]: refuse subscribes and sends, ending every live subscription
//! - [`LocalHub::drop_next`]: silently lose the next N published messages
//! - [`LocalHub::disconnect_all`]: end every live subscription

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use super::{ChannelSink, Subscription, Transport, TransportError};
use crate::broadcast::{BroadcastGroup, MemberId, RoomManager};
use crate::protocol::SyncMessage;

/// Default per-channel buffer.
pub const DEFAULT_CAPACITY: usize = 256;

struct HubState {
    rooms: RoomManager<SyncMessage>,
    online: AtomicBool,
    drop_budget: AtomicU64,
    /// Bumped to end every live subscription.
    epoch: watch::Sender<u64>,
    capacity: usize,
}

/// In-process pub/sub hub. Cloning shares the same hub.
#[derive(Clone)]
pub struct LocalHub {
    state: Arc<HubState>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Arc::new(HubState {
                rooms: RoomManager::new(capacity),
                online: AtomicBool::new(true),
                drop_budget: AtomicU64::new(0),
                epoch,
                capacity,
            }),
        }
    }

    /// Take the hub offline (ending every subscription) or bring it back.
    pub fn set_online(&self, online: bool) {
        self.state.online.store(online, Ordering::SeqCst);
        if !online {
            self.disconnect_all();
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    /// Silently drop the next `n` published messages.
    pub fn drop_next(&self, n: u64) {
        self.state.drop_budget.store(n, Ordering::SeqCst);
    }

    /// End every live subscription. New subscribes still succeed.
    pub fn disconnect_all(&self) {
        log::debug!("LocalHub: disconnecting all subscriptions");
        self.state.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Number of live subscriptions on `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        match self.state.rooms.get(channel).await {
            Some(room) => room.member_count().await,
            None => 0,
        }
    }

    /// Messages published on `channel` so far (dropped ones excluded).
    pub async fn messages_sent(&self, channel: &str) -> u64 {
        match self.state.rooms.get(channel).await {
            Some(room) => room.stats().await.messages_sent,
            None => 0,
        }
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        if !self.is_online() {
            return Err(TransportError::Unavailable("hub offline".into()));
        }

        let room = self.state.rooms.get_or_create(channel).await;
        let (member, rx) = room.join().await;
        let (tx, inbound) = mpsc::channel(self.state.capacity.max(1));
        let (cancel, cancelled) = watch::channel(false);

        tokio::spawn(forward(
            room.clone(),
            member,
            rx,
            tx,
            self.state.epoch.subscribe(),
            cancelled,
        ));
        log::debug!("LocalHub: member {member} joined channel {channel}");

        Ok(Subscription {
            sink: Arc::new(LocalSink {
                hub: self.state.clone(),
                room,
                member,
                cancel,
            }),
            inbound,
        })
    }
}

/// Forward channel traffic to one subscription, skipping its own messages.
async fn forward(
    room: Arc<BroadcastGroup<SyncMessage>>,
    member: MemberId,
    mut rx: broadcast::Receiver<crate::broadcast::Envelope<SyncMessage>>,
    tx: mpsc::Sender<SyncMessage>,
    mut epoch: watch::Receiver<u64>,
    mut cancelled: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = epoch.changed() => break,
            _ = cancelled.changed() => break,
            _ = tx.closed() => break,
            recv = rx.recv() => match recv {
                Ok(envelope) => {
                    if envelope.from == member {
                        continue;
                    }
                    if tx.send((*envelope.payload).clone()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("LocalHub: member {member} lagged by {n} messages");
                    room.record_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    room.leave(member).await;
}

struct LocalSink {
    hub: Arc<HubState>,
    room: Arc<BroadcastGroup<SyncMessage>>,
    member: MemberId,
    cancel: watch::Sender<bool>,
}

impl ChannelSink for LocalSink {
    fn send(&self, message: &SyncMessage) -> Result<(), TransportError> {
        if !self.hub.online.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("hub offline".into()));
        }
        if *self.cancel.borrow() {
            return Err(TransportError::Closed);
        }
        let dropped = self
            .hub
            .drop_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            log::trace!("LocalHub: dropped {} from member {}", message.event, self.member);
            return Ok(());
        }
        self.room.broadcast(self.member, Arc::new(message.clone()));
        Ok(())
    }

    fn unsubscribe(&self) {
        self.cancel.send_replace(true);
    }
}
