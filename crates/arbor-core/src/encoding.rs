//! Binary codec for node records
//!
//! Backends store nodes under their NodeKey bytes; the record itself holds
//! everything else. Layout, all integers big-endian:
//!
//! ```text
//! height:   i8   (1 byte; 0 marks a leaf)
//! size:     i64  (8 bytes)
//! hash:     32 bytes
//! key_len:  u32 + key bytes
//! leaf:     value_len: u32 + value bytes
//! internal: left NodeKey (16 bytes) + right NodeKey (16 bytes)
//! ```
//!
//! Only finalized nodes are encodable: the hash must be cached and child
//! references must be in NodeKey form.

use crate::error::{ArborError, ArborResult};
use crate::node::{Node, NodeHash, NodeKey, NodeRef, NODE_KEY_SIZE};

/// Fixed prefix ahead of the key: height + size + hash + key_len.
const FIXED_PREFIX: usize = 1 + 8 + 32 + 4;

/// Encode a finalized node into its record bytes.
pub fn encode_node(node: &Node) -> ArborResult<Vec<u8>> {
    let hash = node.hash().ok_or_else(|| ArborError::Decode {
        reason: "node has no cached hash".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FIXED_PREFIX + node.key().len() + 64);
    buf.push(node.subtree_height() as u8);
    buf.extend_from_slice(&node.size().to_be_bytes());
    buf.extend_from_slice(hash);
    buf.extend_from_slice(&(node.key().len() as u32).to_be_bytes());
    buf.extend_from_slice(node.key());

    if node.is_leaf() {
        buf.extend_from_slice(&(node.value().len() as u32).to_be_bytes());
        buf.extend_from_slice(node.value());
    } else {
        let left = node.left_key().ok_or_else(|| ArborError::Decode {
            reason: "internal node with unfinalized left child".to_string(),
        })?;
        let right = node.right_key().ok_or_else(|| ArborError::Decode {
            reason: "internal node with unfinalized right child".to_string(),
        })?;
        buf.extend_from_slice(&left.to_bytes());
        buf.extend_from_slice(&right.to_bytes());
    }

    Ok(buf)
}

/// Decode a node record read back under `node_key`.
///
/// The returned node is clean: it is a faithful image of a durable record.
pub fn decode_node(node_key: NodeKey, bytes: &[u8]) -> ArborResult<Node> {
    if bytes.len() < FIXED_PREFIX {
        return Err(ArborError::Decode {
            reason: format!("record too short: {} bytes, need at least {}", bytes.len(), FIXED_PREFIX),
        });
    }

    let height = bytes[0] as i8;
    let size = i64::from_be_bytes(bytes[1..9].try_into().expect("8-byte slice"));
    let mut hash: NodeHash = [0u8; 32];
    hash.copy_from_slice(&bytes[9..41]);
    let key_len = u32::from_be_bytes(bytes[41..45].try_into().expect("4-byte slice")) as usize;

    let key_end = FIXED_PREFIX + key_len;
    if bytes.len() < key_end {
        return Err(ArborError::Decode {
            reason: format!("key truncated: want {} bytes past offset {}", key_len, FIXED_PREFIX),
        });
    }
    let key = bytes[FIXED_PREFIX..key_end].to_vec();

    if height == 0 {
        if bytes.len() < key_end + 4 {
            return Err(ArborError::Decode {
                reason: "leaf record missing value length".to_string(),
            });
        }
        let value_len =
            u32::from_be_bytes(bytes[key_end..key_end + 4].try_into().expect("4-byte slice")) as usize;
        let value_end = key_end + 4 + value_len;
        if bytes.len() < value_end {
            return Err(ArborError::Decode {
                reason: format!("value truncated: want {} bytes past offset {}", value_len, key_end + 4),
            });
        }
        let value = bytes[key_end + 4..value_end].to_vec();

        let mut node = Node::leaf(key, value);
        node.hash = Some(hash);
        node.node_key = Some(node_key);
        node.dirty = false;
        Ok(node)
    } else {
        let children_end = key_end + 2 * NODE_KEY_SIZE;
        if bytes.len() < children_end {
            return Err(ArborError::Decode {
                reason: "internal record missing child keys".to_string(),
            });
        }
        let left_bytes: [u8; NODE_KEY_SIZE] =
            bytes[key_end..key_end + NODE_KEY_SIZE].try_into().expect("16-byte slice");
        let right_bytes: [u8; NODE_KEY_SIZE] = bytes
            [key_end + NODE_KEY_SIZE..children_end]
            .try_into()
            .expect("16-byte slice");

        let mut node = Node::internal(
            key,
            NodeRef::Key(NodeKey::from_bytes(&left_bytes)),
            NodeRef::Key(NodeKey::from_bytes(&right_bytes)),
            height,
            size,
        );
        node.hash = Some(hash);
        node.node_key = Some(node_key);
        node.dirty = false;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{hash_internal, hash_leaf};

    fn finalized_leaf(key: &[u8], value: &[u8], nk: NodeKey) -> Node {
        let mut node = Node::leaf(key.to_vec(), value.to_vec());
        node.hash = Some(hash_leaf(key, value));
        node.node_key = Some(nk);
        node
    }

    #[test]
    fn test_leaf_roundtrip() {
        let nk = NodeKey::new(1, 1);
        let node = finalized_leaf(b"alpha", b"beta", nk);

        let bytes = encode_node(&node).unwrap();
        let back = decode_node(nk, &bytes).unwrap();

        assert!(back.is_leaf());
        assert!(!back.is_dirty());
        assert_eq!(back.key(), b"alpha");
        assert_eq!(back.value(), b"beta");
        assert_eq!(back.hash(), node.hash());
        assert_eq!(back.node_key(), Some(nk));
        assert_eq!(back.size(), 1);
        assert_eq!(back.subtree_height(), 0);
    }

    #[test]
    fn test_internal_roundtrip() {
        let left = NodeKey::new(1, 1);
        let right = NodeKey::new(1, 2);
        let nk = NodeKey::new(1, 3);

        let lh = hash_leaf(b"a", b"1");
        let rh = hash_leaf(b"b", b"2");
        let mut node = Node::internal(b"b".to_vec(), NodeRef::Key(left), NodeRef::Key(right), 1, 2);
        node.hash = Some(hash_internal(1, 2, &lh, &rh));
        node.node_key = Some(nk);

        let bytes = encode_node(&node).unwrap();
        let back = decode_node(nk, &bytes).unwrap();

        assert!(!back.is_leaf());
        assert_eq!(back.key(), b"b");
        assert_eq!(back.left_key(), Some(left));
        assert_eq!(back.right_key(), Some(right));
        assert_eq!(back.subtree_height(), 1);
        assert_eq!(back.size(), 2);
        assert_eq!(back.hash(), node.hash());
    }

    #[test]
    fn test_empty_key_and_value() {
        let nk = NodeKey::new(2, 1);
        let node = finalized_leaf(b"", b"", nk);
        let bytes = encode_node(&node).unwrap();
        let back = decode_node(nk, &bytes).unwrap();
        assert_eq!(back.key(), b"");
        assert_eq!(back.value(), b"");
    }

    #[test]
    fn test_unfinalized_node_rejected() {
        let node = Node::leaf(b"k".to_vec(), b"v".to_vec());
        assert!(matches!(encode_node(&node), Err(ArborError::Decode { .. })));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let nk = NodeKey::new(1, 1);
        let node = finalized_leaf(b"key", b"value", nk);
        let bytes = encode_node(&node).unwrap();

        for cut in [0, 10, FIXED_PREFIX, bytes.len() - 1] {
            let result = decode_node(nk, &bytes[..cut]);
            assert!(matches!(result, Err(ArborError::Decode { .. })), "cut at {}", cut);
        }
    }
}
