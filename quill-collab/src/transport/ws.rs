//! WebSocket client transport for [`HubServer`](crate::hub::HubServer).
//!
//! One WebSocket connection per subscription. The lifecycle is:
//!
//! ```text
//! connect_async(url)
//!   │
//!   ├─► {"type":"join","channel":"<doc>"}
//!   ◄── {"type":"joined","channel":"<doc>"}      (subscription confirmed)
//!   │
//!   ├── writer task: outgoing queue → socket
//!   └── reader task: socket → Subscription::inbound
//! ```
//!
//! The inbound receiver yields `None` as soon as the socket closes, which
//! the session treats as a disconnect.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use super::{ChannelSink, Subscription, Transport, TransportError};
use crate::protocol::{Frame, SyncMessage};

/// Inbound buffer per subscription.
const INBOUND_CAPACITY: usize = 256;

/// WebSocket transport pointed at one hub.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    /// Bound on connecting and on waiting for the join confirmation.
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let (stream, _) = timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::Unavailable(format!("connect to {} timed out", self.url)))?
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let join = Frame::Join {
            channel: channel.to_string(),
        }
        .encode()?;
        writer
            .send(Message::Text(join.into()))
            .await
            .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;

        // Wait for the hub to confirm before reporting the subscription live
        let confirmed = timeout(self.connect_timeout, async {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(Frame::Joined { channel: joined }) if joined == channel => return Ok(()),
                        Ok(Frame::Error { reason }) => return Err(TransportError::SubscribeFailed(reason)),
                        Ok(_) => {}
                        Err(e) => log::warn!("WsTransport: undecodable frame during join: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => return Err(TransportError::Closed),
                    Ok(_) => {}
                }
            }
            Err(TransportError::Closed)
        })
        .await
        .map_err(|_| TransportError::SubscribeFailed("join not confirmed".into()))?;
        confirmed?;

        log::info!("WsTransport: joined channel {channel} on {}", self.url);

        // Writer task: forward outgoing queue to the socket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Reader task: forward broadcast frames to the subscription
        let (in_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader_channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = in_tx.closed() => break,
                    msg = reader.next() => match msg {
                        Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                            Ok(Frame::Broadcast { channel, message }) if channel == reader_channel => {
                                if in_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Frame::Error { reason }) => {
                                log::warn!("WsTransport: hub error on {reader_channel}: {reason}");
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("WsTransport: dropping undecodable frame: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WsTransport: socket error on {reader_channel}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    },
                }
            }
            log::debug!("WsTransport: reader for {reader_channel} finished");
        });

        Ok(Subscription {
            sink: Arc::new(WsSink {
                channel: channel.to_string(),
                outgoing: out_tx,
                closed: AtomicBool::new(false),
            }),
            inbound,
        })
    }
}

struct WsSink {
    channel: String,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl ChannelSink for WsSink {
    fn send(&self, message: &SyncMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let frame = Frame::Broadcast {
            channel: self.channel.clone(),
            message: message.clone(),
        }
        .encode()?;
        self.outgoing
            .send(Message::Text(frame.into()))
            .map_err(|_| TransportError::SendFailed("connection closed".into()))
    }

    fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(leave) = (Frame::Leave {
            channel: self.channel.clone(),
        })
        .encode()
        {
            let _ = self.outgoing.send(Message::Text(leave.into()));
        }
        let _ = self.outgoing.send(Message::Close(None));
    }
}
