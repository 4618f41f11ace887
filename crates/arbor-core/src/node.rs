//! Tree node model — NodeKey identity, leaf/internal records, content hashing
//!
//! A node is either a leaf (key + value) or an internal node (routing key +
//! two child references). Internal nodes refer to children indirectly: by
//! pool slot while the child is still being built in the open version, by
//! NodeKey once the child has been finalized. The indirection is what lets
//! subtrees fall out of memory while the tree stays logically complete.
//!
//! Content hashes are SHA-256 with a leading domain tag (0x00 leaf,
//! 0x01 internal) so a leaf record can never collide with an internal one.

use std::fmt;

use sha2::{Digest, Sha256};

/// A node's 32-byte content hash.
pub type NodeHash = [u8; 32];

/// Serialized width of a NodeKey: 8 bytes version + 8 bytes sequence.
pub const NODE_KEY_SIZE: usize = 16;

/// Durable node identity: the version that finalized the node plus a
/// per-version sequence counter assigned in post-order.
///
/// The byte form is big-endian version followed by big-endian sequence, so
/// for the non-negative values the tree assigns, byte order equals
/// `(version, sequence)` order. Backend writes sort on these bytes for
/// sequential locality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    /// Version whose finalization assigned this key
    pub version: i64,
    /// Post-order position within that version, starting at 1
    pub sequence: i64,
}

impl NodeKey {
    /// Create a node key from its parts.
    pub fn new(version: i64, sequence: i64) -> Self {
        Self { version, sequence }
    }

    /// Byte form: 16 bytes, lexicographically ordered like `(version, sequence)`.
    pub fn to_bytes(&self) -> [u8; NODE_KEY_SIZE] {
        let mut buf = [0u8; NODE_KEY_SIZE];
        buf[0..8].copy_from_slice(&self.version.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sequence.to_be_bytes());
        buf
    }

    /// Parse a node key from its 16-byte form.
    pub fn from_bytes(bytes: &[u8; NODE_KEY_SIZE]) -> Self {
        let version = i64::from_be_bytes(bytes[0..8].try_into().expect("8-byte slice"));
        let sequence = i64::from_be_bytes(bytes[8..16].try_into().expect("8-byte slice"));
        Self { version, sequence }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.version, self.sequence)
    }
}

/// Index of a slot in the node pool.
pub(crate) type SlotId = u32;

/// Reference from an internal node to a child.
///
/// `Slot` points at a dirty node of the open working version, resident in
/// the pool by construction. `Key` names a finalized node, resolved through
/// the pool's resident index first and the backend second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRef {
    /// Working node of the open version, addressed by pool slot
    Slot(SlotId),
    /// Finalized node, addressed by its durable identity
    Key(NodeKey),
}

impl NodeRef {
    /// The durable identity, if this reference is already in key form.
    pub(crate) fn node_key(&self) -> Option<NodeKey> {
        match self {
            NodeRef::Key(k) => Some(*k),
            NodeRef::Slot(_) => None,
        }
    }
}

/// A tree node: leaf or internal record with cached hash.
///
/// Leaves carry the user key and value, `subtree_height` 0 and `size` 1.
/// Internal nodes carry the smallest key of their right subtree for
/// routing, two child references, `subtree_height = 1 + max(children)` and
/// `size = left.size + right.size`. The `dirty` flag is set from creation
/// until a checkpoint makes the node durable.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) hash: Option<NodeHash>,
    pub(crate) node_key: Option<NodeKey>,
    pub(crate) left: Option<NodeRef>,
    pub(crate) right: Option<NodeRef>,
    pub(crate) subtree_height: i8,
    pub(crate) size: i64,
    pub(crate) dirty: bool,
}

impl Node {
    /// Create a dirty working leaf.
    pub(crate) fn leaf(key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
            hash: None,
            node_key: None,
            left: None,
            right: None,
            subtree_height: 0,
            size: 1,
            dirty: true,
        }
    }

    /// Create a dirty working internal node with the given children.
    pub(crate) fn internal(key: Vec<u8>, left: NodeRef, right: NodeRef, height: i8, size: i64) -> Self {
        Self {
            key,
            value: Vec::new(),
            hash: None,
            node_key: None,
            left: Some(left),
            right: Some(right),
            subtree_height: height,
            size,
            dirty: true,
        }
    }

    /// True if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.subtree_height == 0
    }

    /// User key (leaves) or routing key (internal nodes).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Stored value; empty for internal nodes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Cached content hash, present once the node has been finalized.
    pub fn hash(&self) -> Option<&NodeHash> {
        self.hash.as_ref()
    }

    /// Durable identity, present once the node has been finalized.
    pub fn node_key(&self) -> Option<NodeKey> {
        self.node_key
    }

    /// Left child's durable identity; `None` for leaves and for children
    /// still in slot form.
    pub fn left_key(&self) -> Option<NodeKey> {
        self.left.and_then(|r| r.node_key())
    }

    /// Right child's durable identity; `None` for leaves and for children
    /// still in slot form.
    pub fn right_key(&self) -> Option<NodeKey> {
        self.right.and_then(|r| r.node_key())
    }

    /// Height of the subtree rooted here; 0 for a leaf.
    pub fn subtree_height(&self) -> i8 {
        self.subtree_height
    }

    /// Number of leaves in the subtree rooted here.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// True while the node has not been durably persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Assemble a finalized leaf image, as a backend hands it back: hash
    /// cached, identity fixed, clean.
    pub fn durable_leaf(node_key: NodeKey, key: Vec<u8>, value: Vec<u8>) -> Self {
        let hash = hash_leaf(&key, &value);
        Self {
            key,
            value,
            hash: Some(hash),
            node_key: Some(node_key),
            left: None,
            right: None,
            subtree_height: 0,
            size: 1,
            dirty: false,
        }
    }

    /// Assemble a finalized internal-node image from its children's
    /// identities and hashes.
    pub fn durable_internal(
        node_key: NodeKey,
        key: Vec<u8>,
        height: i8,
        size: i64,
        left: (NodeKey, NodeHash),
        right: (NodeKey, NodeHash),
    ) -> Self {
        let hash = hash_internal(height, size, &left.1, &right.1);
        Self {
            key,
            value: Vec::new(),
            hash: Some(hash),
            node_key: Some(node_key),
            left: Some(NodeRef::Key(left.0)),
            right: Some(NodeRef::Key(right.0)),
            subtree_height: height,
            size,
            dirty: false,
        }
    }

    /// Make a dirty working copy of this node, shedding its finalized
    /// identity. The original is left untouched for older versions.
    pub(crate) fn working_clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            hash: None,
            node_key: None,
            left: self.left,
            right: self.right,
            subtree_height: self.subtree_height,
            size: self.size,
            dirty: true,
        }
    }
}

/// Hash of a leaf: `H(0x00 || be32(len key) || key || be32(len value) || value)`.
pub fn hash_leaf(key: &[u8], value: &[u8]) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update((key.len() as u32).to_be_bytes());
    hasher.update(key);
    hasher.update((value.len() as u32).to_be_bytes());
    hasher.update(value);
    hasher.finalize().into()
}

/// Hash of an internal node:
/// `H(0x01 || u8(height) || be64(size) || left_hash || right_hash)`.
pub fn hash_internal(height: i8, size: i64, left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update([height as u8]);
    hasher.update(size.to_be_bytes());
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root hash of the empty tree: `H("")`.
pub fn hash_empty() -> NodeHash {
    Sha256::new().finalize().into()
}
