//! Convergence properties of the replicated document.

use proptest::prelude::*;
use quill_collab::{merge_updates, CollabDoc, Origin};

/// One edit by one of three authors.
#[derive(Debug, Clone)]
enum Edit {
    Insert { author: usize, index: u32, text: String },
    Remove { author: usize, index: u32, len: u32 },
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (0..3usize, 0..40u32, "[a-z ]{1,6}").prop_map(|(author, index, text)| Edit::Insert { author, index, text }),
        1 => (0..3usize, 0..40u32, 1..5u32).prop_map(|(author, index, len)| Edit::Remove { author, index, len }),
    ]
}

/// Run the edits on three isolated authors and collect every produced update.
fn author_updates(edits: &[Edit]) -> Vec<Vec<u8>> {
    let authors = [CollabDoc::new(), CollabDoc::new(), CollabDoc::new()];
    edits
        .iter()
        .filter_map(|edit| match edit {
            Edit::Insert { author, index, text } => authors[*author].insert(*index, text),
            Edit::Remove { author, index, len } => authors[*author].remove(*index, *len),
        })
        .collect()
}

/// Neither replica has seen an edit the other lacks.
fn same_state(a: &CollabDoc, b: &CollabDoc) -> bool {
    a.diff_since(&b.state_vector()).unwrap().is_none() && b.diff_since(&a.state_vector()).unwrap().is_none()
}

fn replay(updates: &[Vec<u8>]) -> CollabDoc {
    let doc = CollabDoc::new();
    for update in updates {
        doc.apply(update, Origin::Remote).unwrap();
    }
    doc
}

proptest! {
    #[test]
    fn test_any_application_order_converges(
        edits in prop::collection::vec(edit(), 1..30),
        seed in any::<u64>(),
    ) {
        let updates = author_updates(&edits);
        let forward = replay(&updates);

        let mut shuffled = updates.clone();
        // Deterministic Fisher-Yates driven by the seed
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let other = replay(&shuffled);

        prop_assert_eq!(forward.text(), other.text());
        prop_assert!(same_state(&forward, &other));
    }

    #[test]
    fn test_apply_is_idempotent(edits in prop::collection::vec(edit(), 1..20)) {
        let updates = author_updates(&edits);
        let once = replay(&updates);
        let twice = replay(&updates);
        for update in &updates {
            twice.apply(update, Origin::Remote).unwrap();
        }
        prop_assert_eq!(once.text(), twice.text());
        prop_assert!(same_state(&once, &twice));
    }

    #[test]
    fn test_merged_update_equals_sequential(edits in prop::collection::vec(edit(), 1..20)) {
        let updates = author_updates(&edits);
        let merged = merge_updates(&updates).unwrap();
        let sequential = replay(&updates);
        let from_merge = replay(&[merged]);
        prop_assert_eq!(sequential.text(), from_merge.text());
    }

    #[test]
    fn test_delta_brings_peer_up_to_date(
        shared in "[a-z]{0,10}",
        extra in prop::collection::vec("[a-z]{1,4}", 1..8),
    ) {
        let sender = CollabDoc::new();
        sender.push(&shared);
        let peer = CollabDoc::new();
        peer.apply(&sender.encode_state(), Origin::Remote).unwrap();

        for chunk in &extra {
            sender.push(chunk);
        }
        if let Some(delta) = sender.diff_since(&peer.state_vector()).unwrap() {
            peer.apply(&delta, Origin::Remote).unwrap();
        }
        prop_assert_eq!(peer.text(), sender.text());
        prop_assert!(sender.diff_since(&peer.state_vector()).unwrap().is_none());
    }
}
