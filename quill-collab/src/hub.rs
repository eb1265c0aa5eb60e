//! WebSocket fan-out hub.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌──► Client B
//!             ├── join "doc-1" ── BroadcastGroup("doc-1")
//! Client B ──┘                          └──► Client A   (never its own frames)
//!
//! Client C ───── join "doc-2" ── BroadcastGroup("doc-2")
//! ```
//!
//! The hub is a dumb relay: it does not hold documents and does not
//! persist anything. Each connection joins one channel at a time and every
//! `broadcast` frame it sends is forwarded to the other members of that
//! channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, Envelope, MemberId, RoomManager};
use crate::protocol::{Frame, SyncMessage};

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document channel
    pub channel_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

impl HubConfig {
    /// Defaults overridden by `QUILL_HUB_ADDR` and `QUILL_HUB_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("QUILL_HUB_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("QUILL_HUB_CAPACITY") {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.channel_capacity = capacity,
                _ => log::warn!("Ignoring invalid QUILL_HUB_CAPACITY={raw}"),
            }
        }
        config
    }

    /// Ephemeral localhost port, small buffers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_channels: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

struct Shared {
    rooms: RoomManager<SyncMessage>,
    stats: AtomicHubStats,
}

/// A bound hub, ready to [`run`](HubServer::run).
pub struct HubServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

/// Channel membership of one connection.
struct Membership {
    channel: String,
    room: Arc<BroadcastGroup<SyncMessage>>,
    member: MemberId,
    rx: broadcast::Receiver<Envelope<SyncMessage>>,
}

impl HubServer {
    /// Bind the listening socket.
    pub async fn bind(config: HubConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        log::info!("Hub listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                rooms: RoomManager::new(config.channel_capacity),
                stats: AtomicHubStats::default(),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A handle that reads statistics while the hub runs.
    pub fn stats_handle(&self) -> HubStatsHandle {
        HubStatsHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Reads hub statistics.
#[derive(Clone)]
pub struct HubStatsHandle {
    shared: Arc<Shared>,
}

impl HubStatsHandle {
    pub async fn stats(&self) -> HubStats {
        let s = &self.shared.stats;
        HubStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_frames: s.total_frames.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            active_channels: self.shared.rooms.room_count().await,
        }
    }
}

async fn leave(shared: &Shared, membership: Membership) {
    membership.room.leave(membership.member).await;
    if shared.rooms.remove_if_empty(&membership.channel).await {
        log::debug!("Channel {} removed (empty)", membership.channel);
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let mut membership: Option<Membership> = None;

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                // Incoming WebSocket frame
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            shared.stats.total_frames.fetch_add(1, Ordering::Relaxed);
                            shared.stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);

                            match Frame::decode(text.as_str()) {
                                Ok(Frame::Join { channel }) => {
                                    if let Some(old) = membership.take() {
                                        leave(&shared, old).await;
                                    }
                                    let room = shared.rooms.get_or_create(&channel).await;
                                    let (member, rx) = room.join().await;
                                    let joined = Frame::Joined { channel: channel.clone() }.encode()?;
                                    ws_sender.send(Message::Text(joined.into())).await?;
                                    log::info!("Connection {addr} joined channel {channel}");
                                    membership = Some(Membership { channel, room, member, rx });
                                }

                                Ok(Frame::Leave { channel }) => {
                                    match membership.take() {
                                        Some(m) if m.channel == channel => leave(&shared, m).await,
                                        other => membership = other,
                                    }
                                }

                                Ok(Frame::Broadcast { channel, message }) => {
                                    match membership.as_ref() {
                                        Some(m) if m.channel == channel => {
                                            log::trace!("Relaying {} on {channel}", message.event);
                                            m.room.broadcast(m.member, Arc::new(message));
                                        }
                                        _ => {
                                            let error = Frame::Error {
                                                reason: format!("not joined to {channel}"),
                                            }
                                            .encode()?;
                                            ws_sender.send(Message::Text(error.into())).await?;
                                        }
                                    }
                                }

                                Ok(other) => {
                                    log::debug!("Ignoring client frame {other:?} from {addr}");
                                }

                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing channel traffic
                envelope = async {
                    match membership.as_mut() {
                        Some(m) => m.rx.recv().await,
                        // No channel joined yet, wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match envelope {
                        Ok(envelope) => {
                            let Some(m) = membership.as_ref() else { continue };
                            // Don't echo back to sender
                            if envelope.from == m.member {
                                continue;
                            }
                            let frame = Frame::Broadcast {
                                channel: m.channel.clone(),
                                message: (*envelope.payload).clone(),
                            }
                            .encode()?;
                            ws_sender.send(Message::Text(frame.into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} messages");
                            if let Some(m) = membership.as_ref() {
                                m.room.record_dropped(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    // Cleanup: leave the channel even when the connection failed
    if let Some(m) = membership.take() {
        leave(&shared, m).await;
    }
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);

    result
}
