//! B+tree node format.
//!
//! A node is either a leaf (sorted key/value pairs) or an internal node
//! (sorted keys with one more child than key). Node size is bounded by
//! serialized byte size (`MAX_NODE_BYTES`), not entry count — this
//! tree's blocks live behind a content-addressed backend rather than a
//! flat file of fixed-size slots, but the bound serves the same
//! purpose: keep a serialized node small enough that one block holds
//! it and splits/merges stay cheap.

use serde::{Deserialize, Serialize};

use tfhfs_block::BlockId;

/// Cheap pre-check before estimating a node's serialized size: below
/// this many entries a node can never have crossed `MAX_NODE_BYTES`
/// from a single insert.
pub const MAX_NODE_ENTRIES: usize = 64;

/// Maximum serialized size a node may reach before a write forces a
/// split — this tree's `nodeMaximumSize` bound.
pub const MAX_NODE_BYTES: usize = 4096;

/// A node below `MAX_NODE_BYTES / MIN_FILL_FACTOR` serialized bytes
/// after a delete is a merge/rebalance candidate.
pub const MIN_FILL_FACTOR: usize = 2;

/// Longest key this tree accepts. The filesystem layer's key encoding
/// (§3: `ino ++ subtype ++ subtype-data`) never approaches this, but
/// the bound exists so a pathological caller can't force an
/// unboundedly large node.
pub const MAX_KEY_SIZE: usize = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
    },
    Internal {
        keys: Vec<Vec<u8>>,
        children: Vec<BlockId>,
    },
}

impl Node {
    pub fn empty_leaf() -> Self {
        Node::Leaf { entries: Vec::new() }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries } => entries.len(),
            Node::Internal { keys, .. } => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn needs_split(&self) -> bool {
        self.serialize().len() > MAX_NODE_BYTES
    }

    pub fn underflows(&self) -> bool {
        self.serialize().len() < MAX_NODE_BYTES / MIN_FILL_FACTOR
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("node serialization never fails for owned data")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Content-addressed id: the blake3 hash of the serialized form.
    /// Two nodes with identical content always collapse to the same
    /// block id, which is what makes unmodified subtrees free to share
    /// across generations.
    pub fn content_id(bytes: &[u8]) -> BlockId {
        blake3::hash(bytes).as_bytes().to_vec()
    }

    /// Binary search a leaf's entries for `key`, returning the slot it
    /// occupies or would be inserted at.
    pub fn leaf_search(entries: &[(Vec<u8>, Vec<u8>)], key: &[u8]) -> Result<usize, usize> {
        entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    /// Find the child index to descend into for `key` in an internal
    /// node: the last child whose separator key is <= `key`.
    pub fn child_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
        match keys.binary_search_by(|k| k.as_slice().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_search_finds_exact_and_insertion_point() {
        let entries = vec![
            (b"b".to_vec(), b"2".to_vec()),
            (b"d".to_vec(), b"4".to_vec()),
        ];
        assert_eq!(Node::leaf_search(&entries, b"d"), Ok(1));
        assert_eq!(Node::leaf_search(&entries, b"c"), Err(1));
        assert_eq!(Node::leaf_search(&entries, b"a"), Err(0));
    }

    #[test]
    fn content_id_is_deterministic() {
        let node = Node::Leaf { entries: vec![(b"k".to_vec(), b"v".to_vec())] };
        let bytes = node.serialize();
        assert_eq!(Node::content_id(&bytes), Node::content_id(&bytes));
    }

    #[test]
    fn round_trips_through_serialize_deserialize() {
        let node = Node::Internal {
            keys: vec![b"m".to_vec()],
            children: vec![vec![1, 2], vec![3, 4]],
        };
        let bytes = node.serialize();
        let back = Node::deserialize(&bytes).unwrap();
        assert!(!back.is_leaf());
        assert_eq!(back.len(), 1);
    }
}
