//! Storage layer: dirty tracking, caching, dual refcounting and the
//! single-writer job queue sitting between the B+tree layer and a
//! [`BlockBackend`].
//!
//! A `Storage` owns the backend and crypto envelope and is meant to
//! live on exactly one thread — the worker spawned by [`StorageHandle`].
//! Everything above this layer talks to the `StorageHandle`, never to
//! `Storage` directly.

mod cache;
mod job;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use thiserror::Error;

use tfhfs_block::{Block, BlockBackend, BlockError, BlockId, BlockStatus};
use tfhfs_crypto::{CryptoEnvelope, CryptoError};

use cache::Cache;
pub use job::StorageHandle;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("storage worker thread is no longer running")]
    WorkerGone,
    #[error("named root {0:?} changed concurrently")]
    RootConflict(String),
}

struct DirtyEntry {
    data: Option<Vec<u8>>,
    status: BlockStatus,
}

/// Owns the backend and all storage-layer bookkeeping. Not `Send` in
/// spirit even though it technically could be — only the worker thread
/// `StorageHandle` spawns should ever touch one.
pub struct Storage {
    backend: Box<dyn BlockBackend>,
    envelope: Box<dyn CryptoEnvelope>,
    cache: Cache,
    dirty: HashMap<BlockId, DirtyEntry>,
    storage_refcounts: HashMap<BlockId, u64>,
    /// Blocks whose on-disk refcount is zero but which are still
    /// storage-referenced; flush must not delete these yet.
    parked_refcnt0: HashSet<BlockId>,
}

impl Storage {
    pub fn new(
        backend: Box<dyn BlockBackend>,
        envelope: Box<dyn CryptoEnvelope>,
        cache_ceiling: usize,
    ) -> Self {
        Self {
            backend,
            envelope,
            cache: Cache::new(cache_ceiling),
            dirty: HashMap::new(),
            storage_refcounts: HashMap::new(),
            parked_refcnt0: HashSet::new(),
        }
    }

    fn is_storage_referenced(&self, id: &[u8]) -> bool {
        self.storage_refcounts.get(id).copied().unwrap_or(0) > 0
    }

    pub fn inc_storage_ref(&mut self, id: &[u8]) {
        *self.storage_refcounts.entry(id.to_vec()).or_insert(0) += 1;
    }

    pub fn dec_storage_ref(&mut self, id: &[u8]) {
        if let Some(count) = self.storage_refcounts.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.storage_refcounts.remove(id);
            }
        }
    }

    /// Read a block's plaintext, decrypting on a cache miss and
    /// populating the cache for next time.
    pub fn get_block(&mut self, id: &BlockId) -> Result<Vec<u8>, StorageError> {
        if let Some(entry) = self.dirty.get(id) {
            return entry.data.clone().ok_or(BlockError::NotFound.into());
        }
        if let Some(entry) = self.cache.get(id) {
            return Ok(entry.data.clone());
        }

        let raw = self.backend.get_block_data(id)?;
        let (plaintext, status) = self.envelope.decrypt(&raw)?;
        self.cache.put(id.clone(), plaintext.clone(), status, false);
        Ok(plaintext)
    }

    /// Queue a block write. Does not touch the backend until [`Storage::flush`].
    pub fn set_block(&mut self, id: BlockId, data: Vec<u8>, status: BlockStatus) {
        self.dirty.insert(
            id.clone(),
            DirtyEntry { data: Some(data.clone()), status },
        );
        self.cache.put(id, data, status, true);
    }

    /// Queue a block deletion.
    pub fn delete_block(&mut self, id: BlockId) {
        self.cache.remove(&id);
        self.dirty.insert(id, DirtyEntry { data: None, status: BlockStatus::WantDelete });
    }

    pub fn get_root(&self, name: &str) -> Option<BlockId> {
        self.backend.get_block_id_by_name(name)
    }

    pub fn set_root(&mut self, name: &str, old: Option<BlockId>, new: BlockId) -> Result<(), StorageError> {
        self.flush()?;
        self.backend.set_in_flush(true);
        let current = self.backend.get_block_id_by_name(name);
        if current != old {
            self.backend.set_in_flush(false);
            return Err(StorageError::RootConflict(name.to_string()));
        }
        self.backend.set_name_to_block_id(name, old.as_deref(), &new);
        self.backend.set_in_flush(false);
        Ok(())
    }

    /// Two-pass-per-round flush: refcount-0 dirty blocks are resolved
    /// first in every round, then positive-refcount blocks, looping
    /// until the dirty set is empty. This ordering is what guarantees
    /// termination — a refcount-0 block's deletion can be the very
    /// thing that makes a parent's pending write settle, so refcount-0
    /// work must drain before refcount>0 work is considered done for
    /// that round.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        self.backend.set_in_flush(true);
        let result = self.flush_rounds();
        self.backend.set_in_flush(false);
        result
    }

    fn flush_rounds(&mut self) -> Result<(), StorageError> {
        let mut guard_rounds = self.dirty.len() + 1;

        while !self.dirty.is_empty() {
            if guard_rounds == 0 {
                warn!("flush did not converge after expected number of rounds");
                return Err(StorageError::WorkerGone);
            }
            guard_rounds -= 1;

            let ids: Vec<BlockId> = self.dirty.keys().cloned().collect();
            let (zero, positive): (Vec<_>, Vec<_>) = ids.into_iter().partition(|id| {
                self.backend
                    .get_block_by_id(id)
                    .map(|b| b.ref_count == 0)
                    .unwrap_or(true)
            });

            for id in zero {
                self.flush_one(&id)?;
            }
            for id in positive {
                self.flush_one(&id)?;
            }
        }

        self.cache.shrink(|id| self.is_storage_referenced(id));
        Ok(())
    }

    fn flush_one(&mut self, id: &BlockId) -> Result<(), StorageError> {
        let Some(entry) = self.dirty.remove(id) else {
            return Ok(());
        };

        let existed = self.backend.get_block_by_id(id).is_some();

        match entry.data {
            None => {
                // WantDelete.
                if self.is_storage_referenced(id) {
                    self.parked_refcnt0.insert(id.clone());
                    debug!("parking delete of {id:?}, still referenced");
                    return Ok(());
                }

                self.parked_refcnt0.remove(id);
                if existed {
                    self.backend.delete_block(id);
                }
            }
            Some(data) => {
                let ciphertext = self.envelope.encrypt(&data, entry.status);
                let ref_count = self.storage_refcounts.get(id).copied().unwrap_or(0);
                let block = Block::new(id.clone(), ciphertext, ref_count);
                if existed {
                    self.backend.update_block(block);
                } else {
                    self.backend.store_block(block);
                }
                self.cache.mark_dirty(id, false);
            }
        }

        Ok(())
    }

    /// `(bytes_used, bytes_available)`, passed straight through from
    /// the backend (`-1` for either if it can't answer) — what a
    /// filesystem's `statfs` reports.
    pub fn backend_stats(&self) -> (i64, i64) {
        (self.backend.get_bytes_used(), self.backend.get_bytes_available())
    }
}

/// Convenience constructor bundling a `Storage` behind a handle that
/// owns a dedicated worker thread, matching this crate's concurrency
/// model (one writer thread draining a bounded job queue; cache-hit
/// reads bypass the queue entirely).
pub fn spawn(
    backend: Box<dyn BlockBackend>,
    envelope: Box<dyn CryptoEnvelope>,
    cache_ceiling: usize,
) -> StorageHandle {
    let storage = Storage::new(backend, envelope, cache_ceiling);
    StorageHandle::spawn(storage)
}

pub use tfhfs_block::BlockStatus as Status;

/// A read-through mirror `StorageHandle` keeps on the submitter side so
/// a cache hit never has to round-trip through the job queue.
pub(crate) type SharedCacheMirror = Arc<Mutex<HashMap<BlockId, Vec<u8>>>>;
