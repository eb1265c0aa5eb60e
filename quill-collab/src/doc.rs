//! Replicated text document.
//!
//! [`CollabDoc`] wraps a `yrs::Doc` holding one shared text and exposes the
//! primitives the replication core drives:
//!
//! - encode full state / encode state vector
//! - delta since a peer's state vector
//! - apply an update under an explicit [`Origin`]
//! - merge several updates into one
//!
//! Every successful mutation is published to subscribers as a [`DocChange`]
//! carrying the produced delta and its origin. The relay and the persistence
//! engine consume that stream in edit order.
//!
//! Updates may arrive in any order. An update that depends on edits this
//! replica has not seen yet is integrated as far as possible and then held
//! whole; it is re-applied after every later update until nothing in it is
//! missing. Yrs is never left with pending structs or deletions of its own.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, TransactionMut, Update,
    WriteTxn,
};

use crate::origin::Origin;

/// Name of the shared text inside the Yrs document.
pub const TEXT_NAME: &str = "content";

/// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// A change notification: the delta a mutation produced and why it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocChange {
    pub update: Vec<u8>,
    pub origin: Origin,
}

/// Errors raised while decoding or integrating updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    /// Bytes are not a valid v1 update or state vector.
    Decode(String),
    /// The update decoded but could not be integrated.
    Apply(String),
    /// Updates could not be merged.
    Merge(String),
}

impl std::fmt::Display for DocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::Decode(e) => write!(f, "Decode error: {e}"),
            DocError::Apply(e) => write!(f, "Apply error: {e}"),
            DocError::Merge(e) => write!(f, "Merge error: {e}"),
        }
    }
}

impl std::error::Error for DocError {}

struct DocInner {
    doc: Doc,
    /// Updates waiting on edits not yet seen, as received.
    held: Mutex<Vec<Vec<u8>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DocChange>>>,
}

/// Shared handle to one replica of a text document.
///
/// Cloning is cheap and every clone refers to the same replica. The editor
/// session owns the document; the relay and persistence engine borrow clones
/// of it for the session's lifetime.
#[derive(Clone)]
pub struct CollabDoc {
    inner: Arc<DocInner>,
}

impl Default for CollabDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollabDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollabDoc")
            .field("len", &self.len())
            .finish()
    }
}

impl CollabDoc {
    /// Create an empty replica with a random client id.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DocInner {
                doc: Doc::new(),
                held: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to change notifications.
    ///
    /// The channel is unbounded so that no local delta is ever lost between
    /// the document and the persistence buffer.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DocChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let txn = self.inner.doc.transact();
        txn.get_text(TEXT_NAME)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Length of the text in the document's index units.
    pub fn len(&self) -> u32 {
        let txn = self.inner.doc.transact();
        txn.get_text(TEXT_NAME).map_or(0, |text| text.len(&txn))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of received updates still waiting on missing edits.
    pub fn held_updates(&self) -> usize {
        self.held().len()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Run a local edit inside one transaction.
    ///
    /// Returns the delta produced, or `None` if the edit changed nothing.
    pub fn edit<F>(&self, f: F) -> Option<Vec<u8>>
    where
        F: FnOnce(&mut TransactionMut, &TextRef),
    {
        let update = {
            let mut txn = self.inner.doc.transact_mut();
            let text = txn.get_or_insert_text(TEXT_NAME);
            f(&mut txn, &text);
            txn.encode_update_v1()
        };
        self.publish(update, Origin::Local)
    }

    /// Insert `chunk` at `index` (clamped to the end of the text).
    pub fn insert(&self, index: u32, chunk: &str) -> Option<Vec<u8>> {
        self.edit(|txn, text| {
            let index = index.min(text.len(txn));
            text.insert(txn, index, chunk);
        })
    }

    /// Append `chunk` to the end of the text.
    pub fn push(&self, chunk: &str) -> Option<Vec<u8>> {
        self.edit(|txn, text| {
            let end = text.len(txn);
            text.insert(txn, end, chunk);
        })
    }

    /// Remove up to `len` characters starting at `index`.
    pub fn remove(&self, index: u32, len: u32) -> Option<Vec<u8>> {
        self.edit(|txn, text| {
            let total = text.len(txn);
            if index >= total {
                return;
            }
            let len = len.min(total - index);
            text.remove_range(txn, index, len);
        })
    }

    // ─── Replication primitives ───────────────────────────────────────

    /// Encode the full replica state as a single update.
    ///
    /// Held updates are merged in, so a snapshot never loses edits that are
    /// still waiting on their predecessors.
    pub fn encode_state(&self) -> Vec<u8> {
        let held = self.held();
        let state = {
            let txn = self.inner.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };
        if held.is_empty() {
            return state;
        }
        let mut parts = Vec::with_capacity(held.len() + 1);
        parts.push(state);
        parts.extend(held.iter().cloned());
        match merge_updates(&parts) {
            Ok(merged) => merged,
            Err(e) => {
                log::warn!("Encoding state without {} held updates: {e}", held.len());
                parts.swap_remove(0)
            }
        }
    }

    /// Encode the state vector summarising which edits this replica has seen.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Compute the edits this replica has that the owner of `remote_sv` lacks.
    ///
    /// Returns `None` when the remote vector already covers ours, so an
    /// up-to-date peer costs zero bytes.
    pub fn diff_since(&self, remote_sv: &[u8]) -> Result<Option<Vec<u8>>, DocError> {
        let remote = decode_state_vector(remote_sv)?;
        let txn = self.inner.doc.transact();
        let local = txn.state_vector();
        if covers(&remote, &local) {
            return Ok(None);
        }
        Ok(Some(txn.encode_diff_v1(&remote)))
    }

    /// Whether the owner of `remote_sv` has seen edits this replica has not.
    pub fn is_behind(&self, remote_sv: &[u8]) -> Result<bool, DocError> {
        let remote = decode_state_vector(remote_sv)?;
        let txn = self.inner.doc.transact();
        Ok(!covers(&txn.state_vector(), &remote))
    }

    /// Merge `update` into the replica and notify subscribers with `origin`.
    ///
    /// The update is fully decoded before anything is integrated, so
    /// malformed bytes never leave the document partially modified. If it
    /// depends on edits not yet seen, it is held and retried after later
    /// updates; held updates it unblocks are integrated in the same change.
    /// Returns `true` if the update changed the replica.
    pub fn apply(&self, update: &[u8], origin: Origin) -> Result<bool, DocError> {
        let decoded = Update::decode_v1(update).map_err(|e| DocError::Decode(e.to_string()))?;
        let delta = {
            let mut held = self.held();
            let mut txn = self.inner.doc.transact_mut();
            if !integrate(&mut txn, decoded)? && !held.iter().any(|h| h.as_slice() == update) {
                held.push(update.to_vec());
            }
            release_held(&mut txn, &mut held);
            txn.encode_update_v1()
        };
        Ok(self.publish(delta, origin).is_some())
    }

    fn publish(&self, update: Vec<u8>, origin: Origin) -> Option<Vec<u8>> {
        if is_empty_update(&update) {
            return None;
        }
        let change = DocChange {
            update: update.clone(),
            origin,
        };
        self.subscribers()
            .retain(|tx| tx.send(change.clone()).is_ok());
        Some(update)
    }

    fn held(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.inner.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<DocChange>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply `update`, then take back whatever Yrs could not integrate.
///
/// Returns `false` if part of the update is waiting on edits not yet seen.
/// The caller keeps the whole update and applies it again later; already
/// integrated blocks and deletions are skipped on the second pass.
fn integrate(txn: &mut TransactionMut, update: Update) -> Result<bool, DocError> {
    txn.apply_update(update)
        .map_err(|e| DocError::Apply(e.to_string()))?;
    if txn.has_missing_updates() {
        txn.prune_pending();
        return Ok(false);
    }
    Ok(true)
}

/// Re-apply held updates until a full pass makes no progress.
fn release_held(txn: &mut TransactionMut, held: &mut Vec<Vec<u8>>) {
    loop {
        let before = held.len();
        let seen = txn.state_vector();
        let mut waiting = Vec::with_capacity(before);
        for bytes in held.drain(..) {
            let result = Update::decode_v1(&bytes)
                .map_err(|e| DocError::Decode(e.to_string()))
                .and_then(|update| integrate(txn, update));
            match result {
                Ok(true) => {}
                Ok(false) => waiting.push(bytes),
                Err(e) => log::warn!("Dropping held update: {e}"),
            }
        }
        *held = waiting;
        if held.is_empty() || (held.len() == before && txn.state_vector() == seen) {
            return;
        }
    }
}

/// Merge several updates into one equivalent update.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, DocError> {
    match updates {
        [] => Ok(EMPTY_UPDATE.to_vec()),
        [single] => Ok(single.clone()),
        _ => {
            let refs: Vec<&[u8]> = updates.iter().map(Vec::as_slice).collect();
            yrs::merge_updates_v1(refs.as_slice()).map_err(|e| DocError::Merge(e.to_string()))
        }
    }
}

/// Whether `update` carries no structs and no deletions.
pub fn is_empty_update(update: &[u8]) -> bool {
    update == EMPTY_UPDATE
}

fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DocError> {
    StateVector::decode_v1(bytes).map_err(|e| DocError::Decode(e.to_string()))
}

/// `a` has observed at least every edit `b` has.
fn covers(a: &StateVector, b: &StateVector) -> bool {
    b.iter().all(|(client, clock)| a.get(client) >= *clock)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(text: &str) -> CollabDoc {
        let doc = CollabDoc::new();
        doc.push(text);
        doc
    }

    #[test]
    fn test_local_edit_produces_delta() {
        let doc = CollabDoc::new();
        let delta = doc.insert(0, "INT. KITCHEN - NIGHT").unwrap();
        assert!(!is_empty_update(&delta));
        assert_eq!(doc.text(), "INT. KITCHEN - NIGHT");
    }

    #[test]
    fn test_noop_edit_produces_nothing() {
        let doc = doc_with("abc");
        assert!(doc.insert(1, "").is_none());
        assert!(doc.remove(10, 2).is_none());
    }

    #[test]
    fn test_insert_index_is_clamped() {
        let doc = doc_with("abc");
        doc.insert(99, "d");
        assert_eq!(doc.text(), "abcd");
        doc.remove(2, 99);
        assert_eq!(doc.text(), "ab");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let source = doc_with("FADE IN:");
        let update = source.encode_state();

        let replica = CollabDoc::new();
        assert!(replica.apply(&update, Origin::Remote).unwrap());
        let once = replica.encode_state();
        assert!(!replica.apply(&update, Origin::Remote).unwrap());

        assert_eq!(replica.encode_state(), once);
        assert_eq!(replica.text(), "FADE IN:");
    }

    #[test]
    fn test_apply_order_independent() {
        let a = CollabDoc::new();
        let b = CollabDoc::new();
        let u1 = a.push("hello ").unwrap();
        let u2 = b.push("world").unwrap();

        let left = CollabDoc::new();
        left.apply(&u1, Origin::Remote).unwrap();
        left.apply(&u2, Origin::Remote).unwrap();

        let right = CollabDoc::new();
        right.apply(&u2, Origin::Remote).unwrap();
        right.apply(&u1, Origin::Remote).unwrap();

        assert_eq!(left.text(), right.text());
        assert!(left.diff_since(&right.state_vector()).unwrap().is_none());
        assert!(right.diff_since(&left.state_vector()).unwrap().is_none());
    }

    #[test]
    fn test_update_waits_for_missing_predecessor() {
        let author = CollabDoc::new();
        let first = author.push("INT. ").unwrap();
        let second = author.push("HOUSE").unwrap();

        let replica = CollabDoc::new();
        assert!(!replica.apply(&second, Origin::Remote).unwrap());
        assert_eq!(replica.held_updates(), 1);
        assert_eq!(replica.text(), "");

        assert!(replica.apply(&first, Origin::Remote).unwrap());
        assert_eq!(replica.held_updates(), 0);
        assert_eq!(replica.text(), "INT. HOUSE");
        assert!(author.diff_since(&replica.state_vector()).unwrap().is_none());
    }

    #[test]
    fn test_delete_spanning_unseen_insert_applies_fully() {
        let author = CollabDoc::new();
        let abc = author.push("abc").unwrap();
        let def = author.push("def").unwrap();
        let cut = author.remove(1, 4).unwrap();
        assert_eq!(author.text(), "af");

        // The deletion covers text the replica has partly seen
        let replica = CollabDoc::new();
        replica.apply(&abc, Origin::Remote).unwrap();
        replica.apply(&cut, Origin::Remote).unwrap();
        assert_eq!(replica.held_updates(), 1);
        replica.apply(&def, Origin::Remote).unwrap();

        assert_eq!(replica.text(), "af");
        assert_eq!(replica.held_updates(), 0);
    }

    #[test]
    fn test_full_state_includes_held_updates() {
        let author = CollabDoc::new();
        let first = author.push("FADE ").unwrap();
        let second = author.push("OUT.").unwrap();

        let holder = CollabDoc::new();
        holder.apply(&second, Origin::Remote).unwrap();

        let restored = CollabDoc::new();
        restored.apply(&holder.encode_state(), Origin::DbLoad).unwrap();
        restored.apply(&first, Origin::Remote).unwrap();
        assert_eq!(restored.text(), "FADE OUT.");
    }

    #[test]
    fn test_diff_since_brings_peer_up_to_date() {
        let sender = doc_with("CUT TO:");
        let peer = CollabDoc::new();
        peer.apply(&sender.encode_state(), Origin::Remote).unwrap();

        sender.push(" BLACK.");
        let delta = sender.diff_since(&peer.state_vector()).unwrap().unwrap();
        peer.apply(&delta, Origin::Remote).unwrap();

        assert_eq!(peer.text(), "CUT TO: BLACK.");
        assert!(sender.diff_since(&peer.state_vector()).unwrap().is_none());
    }

    #[test]
    fn test_diff_since_equal_vectors_is_none() {
        let a = doc_with("same");
        let b = CollabDoc::new();
        b.apply(&a.encode_state(), Origin::Remote).unwrap();
        assert!(a.diff_since(&b.state_vector()).unwrap().is_none());
        assert!(b.diff_since(&a.state_vector()).unwrap().is_none());
    }

    #[test]
    fn test_is_behind() {
        let a = doc_with("ahead");
        let b = CollabDoc::new();
        assert!(b.is_behind(&a.state_vector()).unwrap());
        assert!(!a.is_behind(&b.state_vector()).unwrap());
    }

    #[test]
    fn test_encode_state_roundtrip() {
        let doc = doc_with("EXT. ROOFTOP - DAY");
        doc.remove(0, 5);

        let restored = CollabDoc::new();
        restored.apply(&doc.encode_state(), Origin::DbLoad).unwrap();
        assert_eq!(restored.text(), doc.text());
        assert!(doc.diff_since(&restored.state_vector()).unwrap().is_none());
    }

    #[test]
    fn test_merge_updates_equivalent_to_sequential_apply() {
        let doc = CollabDoc::new();
        let deltas: Vec<Vec<u8>> = "SCENE".chars()
            .filter_map(|c| doc.push(&c.to_string()))
            .collect();
        let merged = merge_updates(&deltas).unwrap();

        let replica = CollabDoc::new();
        replica.apply(&merged, Origin::Remote).unwrap();
        assert_eq!(replica.text(), "SCENE");
    }

    #[test]
    fn test_merge_edge_cases() {
        assert!(is_empty_update(&merge_updates(&[]).unwrap()));
        let single = vec![doc_with("x").encode_state()];
        assert_eq!(merge_updates(&single).unwrap(), single[0]);
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = doc_with("keep me");
        let err = doc.apply(&[0xFF, 0xFF, 0xFF], Origin::Remote).unwrap_err();
        assert!(matches!(err, DocError::Decode(_) | DocError::Apply(_)));
        assert_eq!(doc.text(), "keep me");
    }

    #[test]
    fn test_subscribers_receive_origin() {
        let doc = CollabDoc::new();
        let mut rx = doc.subscribe();

        doc.push("a");
        let other = doc_with("b");
        doc.apply(&other.encode_state(), Origin::Remote).unwrap();
        doc.apply(&other.encode_state(), Origin::DbLoad).unwrap();

        assert_eq!(rx.try_recv().unwrap().origin, Origin::Local);
        assert_eq!(rx.try_recv().unwrap().origin, Origin::Remote);
        // Re-applying known state changes nothing and notifies nobody
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let doc = CollabDoc::new();
        let rx = doc.subscribe();
        drop(rx);
        doc.push("x");
        assert!(doc.subscribers().is_empty());
    }
}
