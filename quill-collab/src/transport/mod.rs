//! Broadcast transport abstraction.
//!
//! The relay needs exactly three things from the network: subscribe to a
//! named channel, publish a [`SyncMessage`] on it, and receive messages other
//! sessions published. Delivery is best-effort. Messages may be lost or
//! duplicated, and a subscription may end at any time; the sync handshake
//! recovers from all of it.
//!
//! ```text
//!                    ┌──────────────────────┐
//!   SyncRelay ──────►│ Transport::subscribe │──► Subscription
//!                    └──────────────────────┘      ├─ sink: Arc<dyn ChannelSink>   (publish)
//!                                                  └─ inbound: mpsc::Receiver      (receive)
//! ```
//!
//! Implementations:
//! - [`local::LocalHub`]: in-process pub/sub with fault injection
//! - [`ws::WsTransport`]: WebSocket client for [`HubServer`](crate::hub::HubServer)

pub mod local;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{ProtocolError, SyncMessage};

/// Transport failures. All of them are recovered by reconnect and resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport cannot be reached.
    Unavailable(String),
    /// The channel subscription was refused or never confirmed.
    SubscribeFailed(String),
    /// A publish did not leave this process.
    SendFailed(String),
    /// The subscription has ended.
    Closed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unavailable(e) => write!(f, "Transport unavailable: {e}"),
            TransportError::SubscribeFailed(e) => write!(f, "Subscribe failed: {e}"),
            TransportError::SendFailed(e) => write!(f, "Send failed: {e}"),
            TransportError::Closed => write!(f, "Subscription closed"),
            TransportError::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

/// Publishing half of a channel subscription.
pub trait ChannelSink: Send + Sync {
    /// Publish `message` to every other subscriber of the channel.
    fn send(&self, message: &SyncMessage) -> Result<(), TransportError>;

    /// End the subscription. The paired inbound receiver then yields `None`.
    fn unsubscribe(&self);
}

/// A confirmed subscription to one channel.
///
/// When `inbound` yields `None` the subscription is gone and the owner
/// should treat the channel as disconnected.
pub struct Subscription {
    pub sink: std::sync::Arc<dyn ChannelSink>,
    pub inbound: mpsc::Receiver<SyncMessage>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A pub/sub transport keyed by channel name.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to `channel`. Resolves once the subscription is confirmed.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}
