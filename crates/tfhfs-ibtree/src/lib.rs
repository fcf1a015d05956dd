//! Immutable, content-addressed, copy-on-write B+tree.
//!
//! Keys are the fixed big-endian byte layout the filesystem layer
//! produces (see that crate's `keys` module); this tree does not
//! generalize over key types the way the node-level `TreeValue` trait
//! generalizes over value types, since the filesystem layer is this
//! system's only key producer.

mod node;
mod transaction;

use thiserror::Error;

use tfhfs_block::BlockId;
use tfhfs_storage::{StorageError, StorageHandle};

pub use node::{MAX_KEY_SIZE, MAX_NODE_BYTES, MAX_NODE_ENTRIES, MIN_FILL_FACTOR};
pub use transaction::Transaction;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("key exceeds MAX_KEY_SIZE")]
    KeyTooLarge,
    #[error("node failed to deserialize")]
    Corrupt,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Values stored in tree leaves are arbitrary serializable payloads —
/// inode metadata, directory entries, xattr bytes, extent records.
/// Keys stay fixed-format bytes; only values need this generality.
pub trait TreeValue: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(bytes: &[u8]) -> Result<Self, TreeError>;
}

/// Owns a handle to the storage layer and opens transactions against
/// named roots.
pub struct Tree {
    storage: StorageHandle,
}

impl Tree {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    /// Begin a transaction over a brand-new, empty tree.
    pub fn new_root(&self) -> Transaction {
        Transaction::new(self.storage.clone(), None)
    }

    /// Begin a transaction over a previously committed root.
    pub fn load_root(&self, root: BlockId) -> Transaction {
        Transaction::new(self.storage.clone(), Some(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfhfs_block::InMemoryBlockBackend;
    use tfhfs_crypto::AesGcmEnvelope;

    fn test_tree() -> Tree {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = Box::new(AesGcmEnvelope::new(b"pw", &salt));
        let backend = Box::new(InMemoryBlockBackend::new());
        Tree::new(tfhfs_storage::spawn(backend, envelope, 1 << 20))
    }

    #[test]
    fn get_after_set_returns_last_value() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        tx.set(b"a", b"1").unwrap();
        tx.set(b"a", b"2").unwrap();
        assert_eq!(tx.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_all_keys_yields_empty_root() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        for i in 0u16..500 {
            tx.set(&i.to_be_bytes(), b"x").unwrap();
        }
        for i in 0u16..500 {
            assert!(tx.delete(&i.to_be_bytes()).unwrap());
        }
        for i in 0u16..500 {
            assert_eq!(tx.get(&i.to_be_bytes()).unwrap(), None);
        }
        let root_id = tx.commit().unwrap();

        let mut reloaded = tree.load_root(root_id);
        assert_eq!(reloaded.get(b"anything").unwrap(), None);
        assert_eq!(reloaded.next_key(b"").unwrap(), None);
    }

    #[test]
    fn next_key_and_prev_key_are_consistent() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        tx.set(b"a", b"1").unwrap();
        tx.set(b"c", b"3").unwrap();
        tx.set(b"e", b"5").unwrap();

        assert_eq!(tx.next_key(b"a").unwrap(), Some(b"c".to_vec()));
        assert_eq!(tx.next_key(b"c").unwrap(), Some(b"e".to_vec()));
        assert_eq!(tx.next_key(b"e").unwrap(), None);

        assert_eq!(tx.prev_key(b"e").unwrap(), Some(b"c".to_vec()));
        assert_eq!(tx.prev_key(b"c").unwrap(), Some(b"a".to_vec()));
        assert_eq!(tx.prev_key(b"a").unwrap(), None);
    }

    #[test]
    fn iterate_delta_finds_only_changed_keys() {
        let tree = test_tree();
        let mut base = tree.new_root();
        base.set(b"a", b"1").unwrap();
        base.set(b"b", b"2").unwrap();
        let base_root = base.commit().unwrap();

        let mut modified = tree.load_root(base_root.clone());
        modified.set(b"b", b"22").unwrap();

        let mut unchanged = tree.load_root(base_root.clone());
        let no_delta = unchanged.iterate_delta(&mut tree.load_root(base_root)).unwrap();
        assert!(no_delta.is_empty());

        let delta = modified.iterate_delta(&mut unchanged).unwrap();
        assert_eq!(delta, vec![(Some(b"2".to_vec()), Some(b"22".to_vec()))]);
    }

    #[test]
    fn iterate_delta_reports_pure_adds_and_removes() {
        let tree = test_tree();
        let mut base = tree.new_root();
        base.set(b"a", b"1").unwrap();
        let base_root = base.commit().unwrap();

        let mut added = tree.load_root(base_root.clone());
        added.set(b"z", b"9").unwrap();
        let delta = added.iterate_delta(&mut tree.load_root(base_root.clone())).unwrap();
        assert_eq!(delta, vec![(None, Some(b"9".to_vec()))]);

        let mut removed = tree.load_root(base_root.clone());
        removed.delete(b"a").unwrap();
        let delta = removed.iterate_delta(&mut tree.load_root(base_root)).unwrap();
        assert_eq!(delta, vec![(Some(b"1".to_vec()), None)]);
    }

    #[test]
    fn delete_range_covers_whole_key_space() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        for i in 0u8..20 {
            tx.set(&[i], b"v").unwrap();
        }
        assert!(tx.delete_range(&[0], &[255]).unwrap());
        assert_eq!(tx.get(&[5]).unwrap(), None);
        assert_eq!(tx.next_key(&[]).unwrap(), None);
    }

    #[test]
    fn delete_range_is_closed_interval_and_leaves_outside_keys() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        for i in 0u8..10 {
            tx.set(&[i], b"v").unwrap();
        }
        assert!(tx.delete_range(&[2], &[5]).unwrap());
        for i in 2u8..=5 {
            assert_eq!(tx.get(&[i]).unwrap(), None);
        }
        assert_eq!(tx.get(&[1]).unwrap(), Some(b"v".to_vec()));
        assert_eq!(tx.get(&[6]).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn commit_is_idempotent_for_unmodified_transaction() {
        let tree = test_tree();
        let mut tx = tree.new_root();
        tx.set(b"a", b"1").unwrap();
        let id1 = tx.commit().unwrap();
        let id2 = tx.commit().unwrap();
        assert_eq!(id1, id2);
    }
}
