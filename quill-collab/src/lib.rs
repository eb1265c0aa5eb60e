//! # quill-collab: Replication and persistence for collaborative documents
//!
//! Keeps every open replica of a text document converged over a broadcast
//! channel, and keeps a durable record (snapshot + update log) from which any
//! replica can be rebuilt.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌──────────────────────────── DocumentSession ───────────────────────────┐
//!  editor ──edit──►│ CollabDoc ──DocChange(origin)──┬──► SyncRelay ──► Transport (channel)   │
//!                  │     ▲                          │        ▲            │                  │
//!                  │     │ apply(Remote)            │        └── inbound ─┘                  │
//!                  │     │ apply(DbLoad)            └──► PersistenceEngine ──► BackingStore  │
//!                  │     └──────────── load ◄─────────────────────┘                          │
//!                  └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every change carries an [`Origin`]. Only `Local` changes are broadcast and
//! persisted; `Remote` changes were persisted by their author and `DbLoad`
//! changes are already durable.
//!
//! ## Modules
//!
//! - [`doc`]: CRDT replica, deltas, merge
//! - [`origin`]: change provenance
//! - [`presence`]: ephemeral per-session presence
//! - [`protocol`]: wire messages and hub frames
//! - [`transport`]: pub/sub channels (in-process and WebSocket)
//! - [`broadcast`]: channel fan-out shared by the in-process hub and the server
//! - [`hub`]: WebSocket fan-out server
//! - [`relay`]: handshake, broadcast-on-write, resync
//! - [`store`]: backing stores and the bytea codec
//! - [`retry`]: bounded exponential backoff
//! - [`persistence`]: load, debounced save, compaction
//! - [`session`]: per-document task tying it all together
//! - [`config`]: tunables

pub mod broadcast;
pub mod config;
pub mod doc;
pub mod hub;
pub mod origin;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod session;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use config::{CollabConfig, PersistenceConfig, SessionConfig, SyncConfig};
pub use doc::{merge_updates, CollabDoc, DocChange, DocError};
pub use hub::{HubConfig, HubServer, HubStats};
pub use origin::Origin;
pub use persistence::{FlushOutcome, LoadReport, PersistError, PersistenceEngine, SaveState, SaveStatus};
pub use presence::{Awareness, AwarenessChange, CursorRange, PresenceState, SessionId};
pub use protocol::{Frame, MessageType, ProtocolError, SyncMessage};
pub use relay::{RelayError, RelayState, RelayStats, SyncRelay};
pub use retry::RetryPolicy;
pub use session::{CloseReport, DocumentSession, SessionError, SessionState};
pub use store::{BackingStore, MemoryStore, RocksStore, StoreConfig, StoreError, Timestamp};
pub use transport::local::LocalHub;
pub use transport::ws::WsTransport;
pub use transport::{Transport, TransportError};
