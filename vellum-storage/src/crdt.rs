//! CRDT primitives over opaque payload bytes.
//!
//! Storage code never inspects document content. Everything it needs is
//! covered by four operations: merge a set of updates into one, diff a doc
//! against a remote state vector, compute a state vector, and (for history
//! rollback) build an update that reverts a doc to an older state.

use yrs::undo::UndoManager;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::StorageError;

/// Recognize structurally-empty payloads.
///
/// A zero-length buffer, `[0]` (the empty state vector) and `[0, 0]` (the
/// empty update) all carry no information. Feeding them into a merge wastes
/// work and can poison the output, so callers skip them.
pub fn is_empty_bin(bin: &[u8]) -> bool {
    bin.is_empty() || bin == [0] || bin == [0, 0]
}

/// Merge update payloads into one compacted update.
///
/// Structurally-empty inputs are skipped. The merge is order-insensitive
/// and replay-stable: the same set of inputs always produces the same
/// bytes.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>, StorageError> {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for bin in updates {
            if is_empty_bin(bin) {
                continue;
            }
            let update = Update::decode_v1(bin).map_err(crdt_err)?;
            txn.apply_update(update).map_err(crdt_err)?;
        }
    }
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&StateVector::default()))
}

/// Update bytes a requester with `state_vector` is missing from `bin`.
pub fn diff_update(bin: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, StorageError> {
    let doc = doc_from_update(bin)?;
    let sv = if is_empty_bin(state_vector) {
        StateVector::default()
    } else {
        StateVector::decode_v1(state_vector).map_err(crdt_err)?
    };
    let txn = doc.transact();
    Ok(txn.encode_diff_v1(&sv))
}

/// Encoded state vector of a full doc payload.
pub fn state_vector_of(bin: &[u8]) -> Result<Vec<u8>, StorageError> {
    let doc = doc_from_update(bin)?;
    let txn = doc.transact();
    Ok(txn.state_vector().encode_v1())
}

/// Build an update that, applied on top of `newer_bin`, brings the doc back
/// to the state captured in `older_bin`.
///
/// The forward diff (older to newer) is applied to a scratch copy of the
/// older doc while an undo manager scoped to its roots watches, then undone
/// structurally. Encoding the scratch doc against the newer state vector
/// yields an ordinary update: history is extended, never rewritten.
pub fn generate_revert_update(
    newer_bin: &[u8],
    older_bin: &[u8],
) -> Result<Vec<u8>, StorageError> {
    let newer = doc_from_update(newer_bin)?;
    let older = doc_from_update(older_bin)?;

    let newer_sv = {
        let txn = newer.transact();
        txn.state_vector()
    };
    let forward = {
        let older_sv = {
            let txn = older.transact();
            txn.state_vector()
        };
        let txn = newer.transact();
        txn.encode_diff_v1(&older_sv)
    };

    let mut manager = undo_manager_over_roots(&older);

    {
        let update = Update::decode_v1(&forward).map_err(crdt_err)?;
        let mut txn = older.transact_mut();
        txn.apply_update(update).map_err(crdt_err)?;
    }

    if let Some(manager) = manager.as_mut() {
        let _ = manager.undo_blocking();
    }

    let txn = older.transact();
    Ok(txn.encode_diff_v1(&newer_sv))
}

/// Undo manager watching every root the doc currently has. `None` when the
/// doc has no roots: there is nothing to revert then, and the forward diff
/// alone reproduces the newer state, making the revert a no-op.
fn undo_manager_over_roots(doc: &Doc) -> Option<UndoManager<()>> {
    let roots: Vec<Out> = {
        let txn = doc.transact();
        txn.root_refs().map(|(_, out)| out).collect()
    };

    let mut manager: Option<UndoManager<()>> = None;
    macro_rules! scope {
        ($root:expr) => {
            match manager.as_mut() {
                Some(m) => m.expand_scope(&$root),
                None => manager = Some(UndoManager::new(doc, &$root)),
            }
        };
    }
    for out in roots {
        match out {
            Out::YText(root) => scope!(root),
            Out::YArray(root) => scope!(root),
            Out::YMap(root) => scope!(root),
            _ => {}
        }
    }
    manager
}

fn doc_from_update(bin: &[u8]) -> Result<Doc, StorageError> {
    let doc = Doc::new();
    if !is_empty_bin(bin) {
        let update = Update::decode_v1(bin).map_err(crdt_err)?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(crdt_err)?;
    }
    Ok(doc)
}

fn crdt_err<E: std::fmt::Display>(err: E) -> StorageError {
    StorageError::Crdt {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    /// Encode an incremental text update on top of `base` (a full doc
    /// payload, or empty for a fresh doc).
    fn text_update(base: &[u8], insert_at: u32, content: &str) -> Vec<u8> {
        let doc = Doc::new();
        if !base.is_empty() {
            let mut txn = doc.transact_mut();
            txn.apply_update(Update::decode_v1(base).unwrap()).unwrap();
        }
        let before = {
            let txn = doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            text.insert(&mut txn, insert_at, content);
        }
        let txn = doc.transact();
        txn.encode_diff_v1(&before)
    }

    fn full_state(updates: &[Vec<u8>]) -> Vec<u8> {
        merge_updates(updates).unwrap()
    }

    fn text_of(bin: &[u8]) -> String {
        let doc = doc_from_update(bin).unwrap();
        let txn = doc.transact();
        match txn.get_text("content") {
            Some(text) => text.get_string(&txn),
            None => String::new(),
        }
    }

    #[test]
    fn test_empty_bin_detection() {
        assert!(is_empty_bin(&[]));
        assert!(is_empty_bin(&[0]));
        assert!(is_empty_bin(&[0, 0]));
        assert!(!is_empty_bin(&[0, 0, 0]));
        assert!(!is_empty_bin(&[1]));
    }

    #[test]
    fn test_merge_combines_updates() {
        let first = text_update(&[], 0, "hello");
        let second = text_update(&full_state(&[first.clone()]), 5, " world");
        let merged = merge_updates(&[first, second]).unwrap();
        assert_eq!(text_of(&merged), "hello world");
    }

    #[test]
    fn test_merge_is_replay_stable() {
        let first = text_update(&[], 0, "abc");
        let second = text_update(&full_state(&[first.clone()]), 3, "def");
        let once = merge_updates(&[first.clone(), second.clone()]).unwrap();
        let twice = merge_updates(&[first, second]).unwrap();
        assert_eq!(once, twice, "same inputs must produce identical bytes");
    }

    #[test]
    fn test_merge_skips_empty_payloads() {
        let real = text_update(&[], 0, "kept");
        let merged =
            merge_updates(&[vec![], vec![0], vec![0, 0], real.clone(), vec![0]]).unwrap();
        assert_eq!(text_of(&merged), "kept");
        // Only empties in: still a valid (empty) doc payload.
        let empty = merge_updates(&[vec![0, 0], vec![0]]).unwrap();
        assert_eq!(text_of(&empty), "");
    }

    #[test]
    fn test_merge_rejects_garbage() {
        let err = merge_updates(&[vec![0xFF, 0x13, 0x37]]).unwrap_err();
        assert!(matches!(err, StorageError::Crdt { .. }));
    }

    #[test]
    fn test_diff_against_empty_state_is_full_doc() {
        let full = full_state(&[text_update(&[], 0, "data")]);
        let diff = diff_update(&full, &[]).unwrap();
        assert_eq!(text_of(&diff), "data");
    }

    #[test]
    fn test_diff_excludes_known_state() {
        let first = text_update(&[], 0, "one");
        let base = full_state(&[first.clone()]);
        let second = text_update(&base, 3, " two");
        let full = full_state(&[first, second]);

        let known_sv = state_vector_of(&base).unwrap();
        let missing = diff_update(&full, &known_sv).unwrap();

        // Applying the diff on top of the known base restores everything.
        let rebuilt = merge_updates(&[base.clone(), missing.clone()]).unwrap();
        assert_eq!(text_of(&rebuilt), "one two");
        assert!(
            missing.len() < full.len(),
            "diff should be smaller than the full doc"
        );
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let full = full_state(&[text_update(&[], 0, "sv")]);
        let sv = state_vector_of(&full).unwrap();
        assert!(StateVector::decode_v1(&sv).is_ok());
        // A doc diffed against its own state vector has nothing to say.
        let nothing = diff_update(&full, &sv).unwrap();
        let rebuilt = merge_updates(&[full.clone(), nothing]).unwrap();
        assert_eq!(text_of(&rebuilt), "sv");
    }

    #[test]
    fn test_revert_update_restores_older_content() {
        let first = text_update(&[], 0, "hello");
        let older = full_state(&[first.clone()]);
        let second = text_update(&older, 5, " world");
        let newer = full_state(&[first, second]);

        let revert = generate_revert_update(&newer, &older).unwrap();
        let rolled_back = merge_updates(&[newer, revert]).unwrap();
        assert_eq!(text_of(&rolled_back), "hello");
    }

    #[test]
    fn test_revert_on_identical_states_is_harmless() {
        let only = full_state(&[text_update(&[], 0, "same")]);
        let revert = generate_revert_update(&only, &only).unwrap();
        let after = merge_updates(&[only, revert]).unwrap();
        assert_eq!(text_of(&after), "same");
    }
}
