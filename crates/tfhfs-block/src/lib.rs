//! Block backend contract.
//!
//! A backend stores opaque, content-identified byte blobs. It knows
//! nothing about trees, inodes, or encryption — the storage layer above
//! it is the only caller, and it is the only thing allowed to call the
//! flush-only operations below.
//!
//! Violating a flush-only or must(-not)-exist constraint is a
//! programmer error in the storage layer, not a recoverable condition:
//! implementations panic rather than return an error for those cases,
//! matching the reference backend this crate's tests are built against.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

pub type BlockId = Vec<u8>;

/// Status a block carries while resident in the storage layer's dirty
/// set or envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    Normal,
    WantSave,
    WantDelete,
    WantSaveWeak,
    Missing,
    Weak,
}

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block not found")]
    NotFound,
    #[error("named root not found")]
    RootNotFound,
    #[error("backend is not accepting flush-only operations")]
    NotInFlush,
}

/// A single stored blob, as the backend sees it: opaque bytes plus the
/// on-disk reference count the storage layer maintains.
#[derive(Clone, Debug)]
pub struct Block {
    pub id: BlockId,
    pub data: Vec<u8>,
    pub ref_count: u64,
}

impl Block {
    pub fn new(id: BlockId, data: Vec<u8>, ref_count: u64) -> Self {
        Self { id, data, ref_count }
    }
}

/// Contract every block backend must satisfy. `Store`/`Update`/`Delete`
/// and `SetNameToBlockId` are flush-only: the storage layer calls
/// `set_in_flush(true)` before issuing any of them and `false` once a
/// flush round completes, and a backend is free to panic if one of
/// them is called outside that window.
pub trait BlockBackend: Send {
    fn get_block_by_id(&self, id: &[u8]) -> Option<Block>;

    fn get_block_data(&self, id: &[u8]) -> Result<Vec<u8>, BlockError>;

    fn get_block_id_by_name(&self, name: &str) -> Option<BlockId>;

    /// Atomically swap a named root from `old` to `new`. `old` must
    /// match the backend's current value for `name` (or be `None` if
    /// the name doesn't exist yet) — flush-only.
    fn set_name_to_block_id(&mut self, name: &str, old: Option<&[u8]>, new: &[u8]);

    /// Store a brand-new block. Panics if `id` already exists — flush-only.
    fn store_block(&mut self, block: Block);

    /// Overwrite an existing block's data/ref_count. Panics if `id`
    /// does not exist — flush-only.
    fn update_block(&mut self, block: Block);

    /// Remove a block entirely. Panics if `id` does not exist — flush-only.
    fn delete_block(&mut self, id: &[u8]);

    /// Total bytes stored, or -1 if the backend can't report it.
    fn get_bytes_used(&self) -> i64;

    /// Bytes still available, or -1 if unbounded/unknown.
    fn get_bytes_available(&self) -> i64;

    /// Called by the storage layer around each flush round so the
    /// backend can enforce the flush-only constraints above.
    fn set_in_flush(&mut self, in_flush: bool);
}

/// Reference in-memory backend. Used as the CLI's default backend and
/// as the substrate for every unit test in this workspace.
pub struct InMemoryBlockBackend {
    inner: Mutex<Inner>,
}

struct Inner {
    blocks: HashMap<BlockId, Block>,
    names: HashMap<String, BlockId>,
    in_flush: bool,
}

impl InMemoryBlockBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                names: HashMap::new(),
                in_flush: false,
            }),
        }
    }

    fn check_in_flush(inner: &Inner, op: &str) {
        if !inner.in_flush {
            panic!("InMemoryBlockBackend::{op} called outside a flush");
        }
    }
}

impl Default for InMemoryBlockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockBackend for InMemoryBlockBackend {
    fn get_block_by_id(&self, id: &[u8]) -> Option<Block> {
        self.inner.lock().unwrap().blocks.get(id).cloned()
    }

    fn get_block_data(&self, id: &[u8]) -> Result<Vec<u8>, BlockError> {
        self.inner
            .lock()
            .unwrap()
            .blocks
            .get(id)
            .map(|b| b.data.clone())
            .ok_or(BlockError::NotFound)
    }

    fn get_block_id_by_name(&self, name: &str) -> Option<BlockId> {
        self.inner.lock().unwrap().names.get(name).cloned()
    }

    fn set_name_to_block_id(&mut self, name: &str, old: Option<&[u8]>, new: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        Self::check_in_flush(&inner, "set_name_to_block_id");
        let current = inner.names.get(name).map(|v| v.as_slice());
        if current != old {
            panic!("set_name_to_block_id: stale old root for {name:?}");
        }
        inner.names.insert(name.to_string(), new.to_vec());
    }

    fn store_block(&mut self, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        Self::check_in_flush(&inner, "store_block");
        if inner.blocks.contains_key(&block.id) {
            panic!("store_block: block {:?} already exists", block.id);
        }
        inner.blocks.insert(block.id.clone(), block);
    }

    fn update_block(&mut self, block: Block) {
        let mut inner = self.inner.lock().unwrap();
        Self::check_in_flush(&inner, "update_block");
        if !inner.blocks.contains_key(&block.id) {
            panic!("update_block: block {:?} does not exist", block.id);
        }
        inner.blocks.insert(block.id.clone(), block);
    }

    fn delete_block(&mut self, id: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        Self::check_in_flush(&inner, "delete_block");
        if inner.blocks.remove(id).is_none() {
            panic!("delete_block: block {id:?} does not exist");
        }
    }

    fn get_bytes_used(&self) -> i64 {
        -1
    }

    fn get_bytes_available(&self) -> i64 {
        -1
    }

    fn set_in_flush(&mut self, in_flush: bool) {
        self.inner.lock().unwrap().in_flush = in_flush;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_get_round_trips() {
        let mut backend = InMemoryBlockBackend::new();
        backend.set_in_flush(true);
        backend.store_block(Block::new(b"id1".to_vec(), b"hello".to_vec(), 1));
        backend.set_in_flush(false);

        let got = backend.get_block_by_id(b"id1").unwrap();
        assert_eq!(got.data, b"hello");
    }

    #[test]
    #[should_panic]
    fn store_block_twice_panics() {
        let mut backend = InMemoryBlockBackend::new();
        backend.set_in_flush(true);
        backend.store_block(Block::new(b"id1".to_vec(), b"a".to_vec(), 1));
        backend.store_block(Block::new(b"id1".to_vec(), b"b".to_vec(), 1));
    }

    #[test]
    #[should_panic]
    fn update_missing_block_panics() {
        let mut backend = InMemoryBlockBackend::new();
        backend.set_in_flush(true);
        backend.update_block(Block::new(b"missing".to_vec(), b"x".to_vec(), 1));
    }

    #[test]
    fn named_root_round_trips() {
        let mut backend = InMemoryBlockBackend::new();
        backend.set_in_flush(true);
        backend.set_name_to_block_id("root", None, b"gen1");
        assert_eq!(backend.get_block_id_by_name("root"), Some(b"gen1".to_vec()));
        backend.set_name_to_block_id("root", Some(b"gen1"), b"gen2");
        assert_eq!(backend.get_block_id_by_name("root"), Some(b"gen2".to_vec()));
    }

    #[test]
    fn bytes_used_and_available_unbounded() {
        let backend = InMemoryBlockBackend::new();
        assert_eq!(backend.get_bytes_used(), -1);
        assert_eq!(backend.get_bytes_available(), -1);
    }
}
