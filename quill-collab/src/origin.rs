//! Why a change happened.
//!
//! Every mutation of a [`CollabDoc`](crate::doc::CollabDoc) or an
//! [`Awareness`](crate::presence::Awareness) map carries an [`Origin`].
//! The relay and the persistence engine read it to avoid feedback loops:
//!
//! | Origin   | Broadcast | Persist |
//! |----------|-----------|---------|
//! | `Local`  | yes       | yes     |
//! | `Remote` | no        | no      |
//! | `DbLoad` | no        | no      |
//!
//! A remote delta is persisted by the process that generated it, and a
//! delta replayed from the store is already durable.

/// Source of a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Produced by this process's own editor session.
    Local,
    /// Received from another replica over the broadcast transport.
    Remote,
    /// Replayed from the backing store during load or compaction catch-up.
    DbLoad,
}

impl Origin {
    /// Whether the relay should fan this change out to peers.
    #[inline]
    pub fn should_broadcast(self) -> bool {
        matches!(self, Origin::Local)
    }

    /// Whether the persistence engine should buffer this change for append.
    #[inline]
    pub fn should_persist(self) -> bool {
        matches!(self, Origin::Local)
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Remote => write!(f, "remote"),
            Origin::DbLoad => write!(f, "db-load"),
        }
    }
}
