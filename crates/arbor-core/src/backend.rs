//! Durable backend contract and the in-memory reference backend
//!
//! The tree needs very little from durable storage: point lookup by
//! NodeKey, durable single-node upsert, and idempotent delete. Anything
//! satisfying `KvDB` can back a tree; `MemoryKv` is the reference
//! implementation used by tests and replay harnesses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::encoding::{decode_node, encode_node};
use crate::error::ArborResult;
use crate::node::{Node, NodeKey, NODE_KEY_SIZE};

/// Minimal durable key-value contract the tree persists through.
///
/// Implementations must provide per-key atomicity and return `set` only
/// once the record is durable. `get` must reproduce every stored field
/// exactly. `delete` of an absent key is not an error.
pub trait KvDB: Send + Sync {
    /// Point lookup by node key.
    fn get(&self, node_key: &NodeKey) -> ArborResult<Option<Node>>;

    /// Durable upsert keyed by the node's own node key.
    /// Returns the number of bytes written.
    fn set(&self, node: &Node) -> ArborResult<usize>;

    /// Remove a node; removing an absent key is a no-op.
    fn delete(&self, node_key: &NodeKey) -> ArborResult<()>;
}

/// Ordered in-memory backend storing encoded node records.
///
/// Goes through the same codec as durable backends so that every test
/// exercises the full encode/decode path. Lifetime counters make write
/// traffic observable.
pub struct MemoryKv {
    nodes: Mutex<BTreeMap<[u8; NODE_KEY_SIZE], Vec<u8>>>,
    set_count: AtomicU64,
    delete_count: AtomicU64,
}

impl MemoryKv {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            set_count: AtomicU64::new(0),
            delete_count: AtomicU64::new(0),
        }
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// True if no nodes are stored.
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Total `set` calls since creation.
    pub fn set_count(&self) -> u64 {
        self.set_count.load(Ordering::Relaxed)
    }

    /// Total `delete` calls that removed a record since creation.
    pub fn delete_count(&self) -> u64 {
        self.delete_count.load(Ordering::Relaxed)
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl KvDB for MemoryKv {
    fn get(&self, node_key: &NodeKey) -> ArborResult<Option<Node>> {
        let nodes = self.nodes.lock();
        match nodes.get(&node_key.to_bytes()) {
            Some(bytes) => Ok(Some(decode_node(*node_key, bytes)?)),
            None => Ok(None),
        }
    }

    fn set(&self, node: &Node) -> ArborResult<usize> {
        let node_key = node.node_key().ok_or_else(|| crate::error::ArborError::Decode {
            reason: "cannot store a node without an assigned node key".to_string(),
        })?;
        let bytes = encode_node(node)?;
        let written = NODE_KEY_SIZE + bytes.len();
        self.nodes.lock().insert(node_key.to_bytes(), bytes);
        self.set_count.fetch_add(1, Ordering::Relaxed);
        Ok(written)
    }

    fn delete(&self, node_key: &NodeKey) -> ArborResult<()> {
        if self.nodes.lock().remove(&node_key.to_bytes()).is_some() {
            self.delete_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::hash_leaf;

    fn finalized_leaf(key: &[u8], value: &[u8], nk: NodeKey) -> Node {
        let mut node = Node::leaf(key.to_vec(), value.to_vec());
        node.hash = Some(hash_leaf(key, value));
        node.node_key = Some(nk);
        node
    }

    #[test]
    fn test_set_get_roundtrip() {
        let db = MemoryKv::new();
        let nk = NodeKey::new(1, 1);
        let node = finalized_leaf(b"k", b"v", nk);

        let written = db.set(&node).unwrap();
        assert!(written > 0);

        let back = db.get(&nk).unwrap().expect("node present");
        assert_eq!(back.key(), node.key());
        assert_eq!(back.value(), node.value());
        assert_eq!(back.hash(), node.hash());
        assert_eq!(back.node_key(), node.node_key());
        assert_eq!(back.size(), node.size());
        assert_eq!(back.subtree_height(), node.subtree_height());
    }

    #[test]
    fn test_get_absent() {
        let db = MemoryKv::new();
        assert!(db.get(&NodeKey::new(1, 1)).unwrap().is_none());
    }

    #[test]
    fn test_delete_idempotent() {
        let db = MemoryKv::new();
        let nk = NodeKey::new(1, 1);
        db.set(&finalized_leaf(b"k", b"v", nk)).unwrap();

        db.delete(&nk).unwrap();
        assert!(db.get(&nk).unwrap().is_none());
        assert_eq!(db.delete_count(), 1);

        // absent delete is a no-op, not an error
        db.delete(&nk).unwrap();
        assert_eq!(db.delete_count(), 1);
    }

    #[test]
    fn test_counters_and_len() {
        let db = MemoryKv::new();
        assert!(db.is_empty());
        db.set(&finalized_leaf(b"a", b"1", NodeKey::new(1, 1))).unwrap();
        db.set(&finalized_leaf(b"b", b"2", NodeKey::new(1, 2))).unwrap();
        // overwrite counts as a set but not as a new record
        db.set(&finalized_leaf(b"a", b"3", NodeKey::new(1, 1))).unwrap();

        assert_eq!(db.len(), 2);
        assert_eq!(db.set_count(), 3);
    }

    #[test]
    fn test_unkeyed_node_rejected() {
        let db = MemoryKv::new();
        let node = Node::leaf(b"k".to_vec(), b"v".to_vec());
        assert!(db.set(&node).is_err());
    }
}
