// Y.Doc wrapper using yrs (y-crdt Rust bindings).
//
// Every replicated document keeps its content in a single root map named
// `state`: one entry per flattened dotted path, each value a JSON-encoded leaf
// string. Concurrent writers therefore converge last-write-wins per leaf.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tracing::warn;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapRef, Out, ReadTxn, StateVector, Subscription, Transact, TransactionMut,
    Update,
};

use deskspace_common::crdt::flatmap::{
    is_under, prune_parent_keys, unflatten, FlatDiff, FlatMap, PATH_SEPARATOR,
};
use deskspace_common::crdt::origin::OriginTag;

/// Name of the root map holding flattened leaves.
pub const STATE_MAP: &str = "state";

/// Wrapper around a Yjs document holding a flat key→leaf map.
pub struct YDoc {
    doc: Doc,
    state: MapRef,
}

impl YDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self::from_doc(Doc::with_options(options))
    }

    fn from_doc(doc: Doc) -> Self {
        let state = doc.get_or_insert_map(STATE_MAP);
        Self { doc, state }
    }

    /// Load a document from a binary state (full snapshot).
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let ydoc = Self::new();
        let update = Update::decode_v1(data).context("failed to decode Yjs state")?;
        ydoc.doc
            .transact_mut()
            .apply_update(update)
            .context("failed to apply Yjs state update")?;
        Ok(ydoc)
    }

    /// Apply an incremental binary update received from a peer, tagged with `origin`.
    pub fn apply_update(&self, data: &[u8], origin: &OriginTag) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode Yjs update")?;
        let origin_bytes = origin.to_bytes();
        self.doc
            .transact_mut_with(origin_bytes.as_slice())
            .apply_update(update)
            .context("failed to apply Yjs update")?;
        Ok(())
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical timestamp) for sync protocol.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute a diff (update) containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    // ── Flat map access ─────────────────────────────────────────────

    /// Merge leaves into the document in one transaction tagged with `origin`.
    ///
    /// Keeps the "no key is both a leaf and a parent" invariant on write:
    /// ancestors of a written leaf are removed, and a scalar leaf replaces any
    /// subtree under its path. An empty object/array written over an existing
    /// subtree is a no-op.
    pub fn merge_leaves(&self, origin: &OriginTag, leaves: &FlatMap) {
        self.overwrite_subtrees(origin, &[], leaves);
    }

    /// Clear every key under `prefixes`, then merge `leaves`, in one
    /// transaction. Used for positional values (arrays) and explicit deletes,
    /// where leaf-by-leaf merging would leave stale entries behind.
    pub fn overwrite_subtrees(&self, origin: &OriginTag, prefixes: &[String], leaves: &FlatMap) {
        if leaves.is_empty() && prefixes.is_empty() {
            return;
        }
        let origin_bytes = origin.to_bytes();
        let mut txn = self.doc.transact_mut_with(origin_bytes.as_slice());
        let mut live: BTreeSet<String> = self.state.keys(&txn).map(str::to_string).collect();

        let cleared: Vec<String> = live
            .iter()
            .filter(|key| prefixes.iter().any(|prefix| is_under(key, prefix)))
            .cloned()
            .collect();
        for key in cleared {
            live.remove(&key);
            self.state.remove(&mut txn, &key);
        }

        for (path, value) in leaves {
            for ancestor in ancestors(path) {
                if live.remove(&ancestor) {
                    self.state.remove(&mut txn, &ancestor);
                }
            }

            let descendants: Vec<String> =
                live.iter().filter(|key| is_strictly_under(key, path)).cloned().collect();
            if !descendants.is_empty() {
                if is_empty_container(value) {
                    continue;
                }
                for key in descendants {
                    live.remove(&key);
                    self.state.remove(&mut txn, &key);
                }
            }

            self.state.insert(&mut txn, path.as_str(), encode_leaf(value));
            live.insert(path.clone());
        }
    }

    /// Remove each prefix and everything beneath it. Returns the number of keys removed.
    pub fn remove_prefixes(&self, origin: &OriginTag, prefixes: &[String]) -> usize {
        if prefixes.is_empty() {
            return 0;
        }
        let origin_bytes = origin.to_bytes();
        let mut txn = self.doc.transact_mut_with(origin_bytes.as_slice());
        let doomed: Vec<String> = self
            .state
            .keys(&txn)
            .filter(|key| prefixes.iter().any(|prefix| is_under(key, prefix)))
            .map(str::to_string)
            .collect();
        for key in &doomed {
            self.state.remove(&mut txn, key);
        }
        doomed.len()
    }

    /// Apply a precomputed set/remove diff in one transaction.
    pub fn apply_flat_diff(&self, origin: &OriginTag, diff: &FlatDiff) {
        if diff.is_empty() {
            return;
        }
        let origin_bytes = origin.to_bytes();
        let mut txn = self.doc.transact_mut_with(origin_bytes.as_slice());
        for key in &diff.remove {
            self.state.remove(&mut txn, key);
        }
        for (key, value) in &diff.set {
            self.state.insert(&mut txn, key.as_str(), encode_leaf(value));
        }
    }

    /// Raw flat entries, unpruned.
    pub fn read_flat(&self) -> FlatMap {
        let txn = self.doc.transact();
        read_flat_in(&self.state, &txn)
    }

    /// Pruned, unflattened document content, or `None` when the document is empty.
    pub fn read_value(&self) -> Option<Value> {
        let flat = self.read_flat();
        if flat.is_empty() {
            return None;
        }
        Some(unflatten(&prune_parent_keys(&flat)))
    }

    /// Register a callback fired after every committed transaction with the
    /// transaction, the encoded v1 update, and the post-commit flat state.
    pub fn observe_updates<F>(&self, callback: F) -> Result<Subscription>
    where
        F: Fn(&TransactionMut, &[u8], FlatMap) + Send + Sync + 'static,
    {
        let state = self.state.clone();
        self.doc
            .observe_update_v1(move |txn, event| {
                let flat = read_flat_in(&state, txn);
                callback(txn, &event.update, flat);
            })
            .map_err(|error| anyhow!("failed to register update observer: {error:?}"))
    }

    /// Get the underlying Doc reference (for advanced operations).
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn read_flat_in<T: ReadTxn>(state: &MapRef, txn: &T) -> FlatMap {
    let mut flat = FlatMap::new();
    for (key, out) in state.iter(txn) {
        match decode_leaf(&out) {
            Some(value) => {
                flat.insert(key.to_string(), value);
            }
            None => warn!(key, "skipping malformed replicated leaf"),
        }
    }
    flat
}

fn encode_leaf(value: &Value) -> String {
    value.to_string()
}

fn decode_leaf(out: &Out) -> Option<Value> {
    match out {
        Out::Any(Any::String(raw)) => serde_json::from_str(raw).ok(),
        _ => None,
    }
}

fn ancestors(path: &str) -> Vec<String> {
    path.match_indices(PATH_SEPARATOR).map(|(index, _)| path[..index].to_string()).collect()
}

fn is_strictly_under(key: &str, prefix: &str) -> bool {
    key != prefix && is_under(key, prefix)
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskspace_common::crdt::flatmap::flatten;
    use deskspace_common::crdt::origin::OriginKind;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn origin() -> OriginTag {
        OriginTag::new(OriginKind::Session, Uuid::new_v4())
    }

    fn sync_docs(source: &YDoc, target: &YDoc) {
        let sv = target.encode_state_vector();
        let diff = source.encode_diff(&sv).unwrap();
        target.apply_update(&diff, &OriginTag::new(OriginKind::Remote, Uuid::nil())).unwrap();
    }

    #[test]
    fn merge_leaves_then_read_value() {
        let doc = YDoc::new();
        doc.merge_leaves(&origin(), &flatten(&json!({ "w1": { "position": { "x": 1, "y": 2 } } })));
        assert_eq!(doc.read_value(), Some(json!({ "w1": { "position": { "x": 1, "y": 2 } } })));
    }

    #[test]
    fn empty_document_reads_as_none() {
        assert!(YDoc::new().read_value().is_none());
    }

    #[test]
    fn scalar_leaf_replaces_subtree_and_child_replaces_leaf_ancestor() {
        let doc = YDoc::new();
        let tag = origin();
        doc.merge_leaves(&tag, &flatten(&json!({ "a": { "b": 1, "c": 2 } })));
        doc.merge_leaves(&tag, &flatten(&json!({ "a": 5 })));
        assert_eq!(doc.read_flat().len(), 1);
        assert_eq!(doc.read_value(), Some(json!({ "a": 5 })));

        doc.merge_leaves(&tag, &flatten(&json!({ "a": { "d": 7 } })));
        assert_eq!(doc.read_value(), Some(json!({ "a": { "d": 7 } })));
        assert!(!doc.read_flat().contains_key("a"));
    }

    #[test]
    fn empty_object_does_not_wipe_existing_subtree() {
        let doc = YDoc::new();
        let tag = origin();
        doc.merge_leaves(&tag, &flatten(&json!({ "app": { "notes": "hi" } })));
        doc.merge_leaves(&tag, &flatten(&json!({ "app": {} })));
        assert_eq!(doc.read_value(), Some(json!({ "app": { "notes": "hi" } })));
    }

    #[test]
    fn overwrite_subtrees_drops_stale_array_slots() {
        let doc = YDoc::new();
        let tag = origin();
        doc.merge_leaves(&tag, &flatten(&json!({ "zOrder": ["a", "b", "c"], "name": "S" })));
        doc.overwrite_subtrees(&tag, &["zOrder".to_string()], &flatten(&json!({ "zOrder": ["c"] })));
        assert_eq!(doc.read_value(), Some(json!({ "zOrder": ["c"], "name": "S" })));
    }

    #[test]
    fn remove_prefixes_only_touches_matching_subtrees() {
        let doc = YDoc::new();
        let tag = origin();
        doc.merge_leaves(
            &tag,
            &flatten(&json!({ "s1": { "x": 1 }, "s10": { "x": 2 }, "s2": { "x": 3 } })),
        );
        let removed = doc.remove_prefixes(&tag, &["s1".to_string()]);
        assert_eq!(removed, 1);
        assert_eq!(doc.read_value(), Some(json!({ "s10": { "x": 2 }, "s2": { "x": 3 } })));
    }

    #[test]
    fn concurrent_leaf_writes_converge() {
        let doc_a = YDoc::with_client_id(1);
        let doc_b = YDoc::with_client_id(2);

        doc_a.merge_leaves(&origin(), &flatten(&json!({ "w1": { "position": { "x": 0, "y": 0 } } })));
        sync_docs(&doc_a, &doc_b);

        doc_a.merge_leaves(&origin(), &flatten(&json!({ "w1": { "position": { "x": 10 } } })));
        doc_b.merge_leaves(&origin(), &flatten(&json!({ "w1": { "size": { "w": 5, "h": 5 } } })));

        sync_docs(&doc_a, &doc_b);
        sync_docs(&doc_b, &doc_a);

        assert_eq!(doc_a.read_value(), doc_b.read_value());
        let value = doc_a.read_value().unwrap();
        assert_eq!(value["w1"]["position"]["x"], json!(10));
        assert_eq!(value["w1"]["size"]["w"], json!(5));
    }

    #[test]
    fn observer_sees_origin_update_and_state() {
        let doc = YDoc::new();
        let tag = origin();
        let seen: Arc<Mutex<Vec<(Option<Vec<u8>>, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_cb = Arc::clone(&seen);
        let _subscription = doc
            .observe_updates(move |txn, update, flat| {
                let origin = txn.origin().map(|value| value.as_ref().to_vec());
                assert!(!update.is_empty());
                seen_for_cb.lock().unwrap().push((origin, flat.len()));
            })
            .expect("subscription should register");

        doc.merge_leaves(&tag, &flatten(&json!({ "a": 1, "b": 2 })));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let decoded = OriginTag::from_bytes(seen[0].0.as_deref().unwrap()).unwrap();
        assert_eq!(decoded.instance_id, tag.instance_id);
        assert_eq!(seen[0].1, 2);
    }

    #[test]
    fn encode_and_load_state() {
        let doc = YDoc::new();
        doc.merge_leaves(&origin(), &flatten(&json!({ "name": "Studio" })));
        let restored = YDoc::from_state(&doc.encode_state()).unwrap();
        assert_eq!(restored.read_value(), Some(json!({ "name": "Studio" })));
    }

    #[test]
    fn invalid_update_returns_error() {
        let doc = YDoc::new();
        assert!(doc.apply_update(b"not a valid update", &origin()).is_err());
    }
}
