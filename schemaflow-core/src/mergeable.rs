//! Opaque mergeable document state.
//!
//! The sync engine never looks inside a workspace document; it only needs
//! to start one, fold updates into it and serialize it. Any state type
//! whose merge is commutative and idempotent can stand in.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Doc, Map, Out, ReadTxn, StateVector, Transact, Update};

use crate::error::MergeError;

/// Mergeable replicated state.
///
/// Contract: merging the same update twice, or a set of updates in any
/// order, converges to the same state as merging each exactly once.
pub trait MergeableState: Send + 'static {
    /// Empty state.
    fn init() -> Self
    where
        Self: Sized;

    /// Fold one encoded update into the state.
    fn merge(&mut self, update: &[u8]) -> Result<(), MergeError>;

    /// Full state as a single update that bootstraps an empty replica.
    fn encode(&self) -> Vec<u8>;

    /// Update carrying what a replica summarized by `remote_state_vector`
    /// is missing. The full state is always a valid answer.
    fn encode_diff(&self, _remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        Ok(self.encode())
    }

    /// Build a state from a persisted snapshot.
    fn hydrate(snapshot: &[u8]) -> Result<Self, MergeError>
    where
        Self: Sized,
    {
        let mut state = Self::init();
        state.merge(snapshot)?;
        Ok(state)
    }
}

/// Named JSON entries stored inside the mergeable state.
///
/// Used by the shared-schema save path, which writes whole named schemas
/// through the same document the live editors merge into.
pub trait KeyedEntries: MergeableState {
    /// Write `value` under `collection[key]` and return the update to broadcast.
    fn put_entry(&mut self, collection: &str, key: &str, value: &str) -> Result<Vec<u8>, MergeError>;

    /// Read `collection[key]`.
    fn get_entry(&self, collection: &str, key: &str) -> Option<String>;
}

/// Yrs-backed mergeable state (compatible with Yjs clients).
pub struct YrsState {
    doc: Doc,
}

impl YrsState {
    /// Underlying Yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Encoded state vector, the first step of the diff handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }
}

impl MergeableState for YrsState {
    fn init() -> Self {
        Self { doc: Doc::new() }
    }

    fn merge(&mut self, update: &[u8]) -> Result<(), MergeError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(e.to_string()))
    }

    fn encode(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote = StateVector::decode_v1(remote_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }
}

impl KeyedEntries for YrsState {
    fn put_entry(&mut self, collection: &str, key: &str, value: &str) -> Result<Vec<u8>, MergeError> {
        // Root types must be resolved before the write transaction opens
        let map = self.doc.get_or_insert_map(collection);
        let mut txn = self.doc.transact_mut();
        map.insert(&mut txn, key.to_string(), value.to_string());
        Ok(txn.encode_update_v1())
    }

    fn get_entry(&self, collection: &str, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        let map = txn.get_map(collection)?;
        match map.get(&txn, key)? {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    /// Insert text at the end of `content` and return the incremental update.
    fn edit(doc: &Doc, insert: &str) -> Vec<u8> {
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("content");
            let len = text.get_string(&txn).len() as u32;
            text.insert(&mut txn, len, insert);
        }
        let txn = doc.transact();
        txn.encode_diff_v1(&before)
    }

    fn content(state: &YrsState) -> String {
        let txn = state.doc().transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    fn state_vector(state: &YrsState) -> StateVector {
        state.doc().transact().state_vector()
    }

    #[test]
    fn test_init_is_empty() {
        let state = YrsState::init();
        assert_eq!(content(&state), "");
        assert_eq!(state_vector(&state), StateVector::default());
    }

    #[test]
    fn test_merge_then_encode_bootstraps_replica() {
        let source = Doc::new();
        let update = edit(&source, "users(id, email)");

        let mut server = YrsState::init();
        server.merge(&update).unwrap();

        let replica = YrsState::hydrate(&server.encode()).unwrap();
        assert_eq!(content(&replica), "users(id, email)");
    }

    #[test]
    fn test_merge_converges_regardless_of_order_and_duplicates() {
        let alice = Doc::new();
        let bob = Doc::new();
        let a1 = edit(&alice, "a1");
        let a2 = edit(&alice, "a2");
        let a3 = edit(&alice, "a3");
        let b1 = edit(&bob, "b1");
        let b2 = edit(&bob, "b2");

        let mut in_order = YrsState::init();
        for u in [&a1, &a2, &a3, &b1, &b2] {
            in_order.merge(u).unwrap();
        }

        let mut shuffled = YrsState::init();
        for u in [&b2, &a3, &a1, &b1, &a1, &a2, &b2, &a3] {
            shuffled.merge(u).unwrap();
        }

        assert_eq!(content(&in_order), content(&shuffled));
        assert_eq!(state_vector(&in_order), state_vector(&shuffled));
        assert!(content(&in_order).contains("a1a2a3"));
    }

    #[test]
    fn test_merge_same_update_twice_is_idempotent() {
        let source = Doc::new();
        let u = edit(&source, "orders");

        let mut state = YrsState::init();
        state.merge(&u).unwrap();
        let once = state.encode();
        state.merge(&u).unwrap();

        assert_eq!(content(&state), "orders");
        assert_eq!(YrsState::hydrate(&once).map(|s| content(&s)).unwrap(), "orders");
    }

    #[test]
    fn test_merge_rejects_garbage() {
        let mut state = YrsState::init();
        let err = state.merge(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, MergeError::Decode(_)));
        assert_eq!(content(&state), "");
    }

    #[test]
    fn test_encode_diff_against_state_vector() {
        let source = Doc::new();
        let u1 = edit(&source, "first");
        let u2 = edit(&source, " second");

        let mut server = YrsState::init();
        server.merge(&u1).unwrap();
        server.merge(&u2).unwrap();

        let mut client = YrsState::init();
        client.merge(&u1).unwrap();
        let diff = server.encode_diff(&client.state_vector()).unwrap();
        client.merge(&diff).unwrap();

        assert_eq!(content(&client), "first second");
    }

    #[test]
    fn test_keyed_entries_roundtrip_through_update() {
        let mut server = YrsState::init();
        let update = server
            .put_entry("schemas", "s1", r#"{"tables":[]}"#)
            .unwrap();
        assert_eq!(
            server.get_entry("schemas", "s1").as_deref(),
            Some(r#"{"tables":[]}"#)
        );

        let mut peer = YrsState::init();
        peer.merge(&update).unwrap();
        assert_eq!(
            peer.get_entry("schemas", "s1").as_deref(),
            Some(r#"{"tables":[]}"#)
        );
        assert!(peer.get_entry("schemas", "missing").is_none());
        assert!(peer.get_entry("other", "s1").is_none());
    }
}
