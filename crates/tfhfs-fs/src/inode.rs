//! Inode tracker, permission checks, and the `Fs` core that the
//! dispatcher drives. `Fs` owns the tree and decides when a batch of
//! tree mutations commits and becomes the new named root — read-only
//! operations use a throwaway transaction that is never committed,
//! mirroring the original's split between `Fs.GetTransaction()` (read)
//! and `Fs.Update(closure)` (read-modify-commit).

use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;

use tfhfs_block::BlockId;
use tfhfs_ibtree::{Transaction, Tree, TreeValue};
use tfhfs_storage::StorageHandle;

use crate::errors::FsError;
use crate::keys::{self, belongs_to};
use crate::meta::InodeMeta;

pub const ROOT_INO: u64 = 1;
const ROOT_NAME: &str = "root";

/// Extent chunk size: writes are split at chunk boundaries and each
/// chunk becomes its own tree value, so a write to one chunk never
/// needs to rewrite the whole file.
pub const EXTENT_CHUNK_SIZE: u64 = 4096;

/// In-memory bookkeeping the kernel's `lookup`/`forget` protocol and
/// open file handles need, decoupled from the on-disk tree. An inode
/// with `nlink == 0` but a live handle or a positive lookup refcount
/// here stays resident — nothing prunes its `META` entry until both
/// drop to zero, and this crate doesn't implement that prune pass
/// (orphan reclamation), matching the original's lack of one too.
pub struct InodeTracker {
    lookup_refs: HashMap<u64, u64>,
    open_files: HashMap<u64, u64>,
    next_fh: u64,
}

impl InodeTracker {
    fn new() -> Self {
        Self { lookup_refs: HashMap::new(), open_files: HashMap::new(), next_fh: 1 }
    }

    pub fn lookup_ref(&mut self, ino: u64) {
        *self.lookup_refs.entry(ino).or_insert(0) += 1;
    }

    pub fn forget(&mut self, ino: u64, n: u64) {
        if let Some(count) = self.lookup_refs.get_mut(&ino) {
            *count = count.saturating_sub(n);
            if *count == 0 {
                self.lookup_refs.remove(&ino);
            }
        }
    }

    pub fn open(&mut self, ino: u64) -> u64 {
        let fh = self.next_fh;
        self.next_fh += 1;
        self.open_files.insert(fh, ino);
        fh
    }

    pub fn file_ino(&self, fh: u64) -> Option<u64> {
        self.open_files.get(&fh).copied()
    }

    pub fn close(&mut self, fh: u64) {
        self.open_files.remove(&fh);
    }

    /// Distinct inodes this process currently holds resident — either
    /// via a kernel lookup refcount or an open file handle. Reported
    /// through `statfs`'s inode-count fields; not a count of every
    /// inode in the tree, which this tracker has no cheap way to know.
    pub fn tracked_count(&self) -> usize {
        let mut inos: std::collections::HashSet<u64> = self.lookup_refs.keys().copied().collect();
        inos.extend(self.open_files.values().copied());
        inos.len()
    }
}

/// `access()`'s permission algorithm: root bypasses everything; world
/// bits always apply; owner bits are added on a uid match, group bits
/// on a gid match; `or_own` lets ownership alone satisfy the check
/// (used by `chmod`/`chown`-style metadata edits) regardless of mode
/// bits.
pub fn check_access(meta: &InodeMeta, uid: u32, gid: u32, mode: i32, or_own: bool) -> bool {
    if uid == 0 {
        return true;
    }
    let mut perms = meta.mode & 0o7;
    if uid == meta.uid {
        if or_own {
            return true;
        }
        perms |= (meta.mode >> 6) & 0o7;
    }
    if gid == meta.gid {
        perms |= (meta.mode >> 3) & 0o7;
    }
    (perms as i32 & mode) == mode
}

pub struct Fs {
    storage: StorageHandle,
    tree: Tree,
    current_root: Mutex<Option<BlockId>>,
    pub tracker: Mutex<InodeTracker>,
}

impl Fs {
    /// Opens (or formats, if the backend has no `"root"` entry yet) a
    /// filesystem over `storage`.
    pub fn new(storage: StorageHandle) -> Result<Self, FsError> {
        let tree = Tree::new(storage.clone());
        let existing = storage.get_root(ROOT_NAME).map_err(tfhfs_ibtree::TreeError::Storage)?;

        let fs = Self {
            storage,
            tree,
            current_root: Mutex::new(existing.clone()),
            tracker: Mutex::new(InodeTracker::new()),
        };

        if existing.is_none() {
            fs.format_root()?;
        }
        Ok(fs)
    }

    fn format_root(&self) -> Result<(), FsError> {
        self.update(|tr| {
            let meta = InodeMeta::new_file(libc::S_IFDIR as u32 | 0o755, 0, 0);
            tr.set(&keys::meta_key(ROOT_INO), &meta.serialize())?;
            Ok(())
        })
    }

    fn read_tx(&self) -> Transaction {
        match self.current_root.lock().unwrap().clone() {
            Some(id) => self.tree.load_root(id),
            None => self.tree.new_root(),
        }
    }

    /// Runs `f` over a working transaction, then commits it and swaps
    /// the named root atomically. Used for every mutating operation.
    fn update<F, R>(&self, f: F) -> Result<R, FsError>
    where
        F: FnOnce(&mut Transaction) -> Result<R, FsError>,
    {
        let old_root = self.current_root.lock().unwrap().clone();
        let mut tr = match old_root.clone() {
            Some(id) => self.tree.load_root(id),
            None => self.tree.new_root(),
        };
        let result = f(&mut tr)?;
        let new_root = tr.commit().map_err(FsError::from)?;
        self.storage
            .set_root(ROOT_NAME, old_root.clone(), new_root.clone())
            .map_err(|e| FsError::from(tfhfs_ibtree::TreeError::Storage(e)))?;
        if old_root.as_ref() != Some(&new_root) {
            self.storage.inc_ref(&new_root);
            if let Some(old) = &old_root {
                self.storage.dec_ref(old);
            }
        }
        *self.current_root.lock().unwrap() = Some(new_root);
        Ok(result)
    }

    pub fn backend_stats(&self) -> (i64, i64) {
        self.storage.stats()
    }

    // -- metadata -----------------------------------------------------

    pub fn get_meta(&self, ino: u64) -> Result<InodeMeta, FsError> {
        let mut tr = self.read_tx();
        let bytes = tr.get(&keys::meta_key(ino))?.ok_or(FsError::NotFound)?;
        Ok(InodeMeta::deserialize(&bytes)?)
    }

    pub fn set_meta(&self, ino: u64, meta: InodeMeta) -> Result<(), FsError> {
        self.update(|tr| {
            tr.set(&keys::meta_key(ino), &meta.serialize())?;
            Ok(())
        })
    }

    // -- lookup / directory structure ----------------------------------

    pub fn lookup_child(&self, parent: u64, name: &str) -> Result<u64, FsError> {
        if name == "." {
            return Ok(parent);
        }
        if name == ".." {
            return self.parent_of(parent);
        }
        let mut tr = self.read_tx();
        let bytes = tr.get(&keys::dir_entry_key(parent, name))?.ok_or(FsError::NotFound)?;
        Ok(ino_from_bytes(&bytes))
    }

    /// First parent found by scanning `REVERSE_DIR_NAME2INODE` entries
    /// for `ino`. Directories in this filesystem are never hard-linked,
    /// so "first" is also "only".
    fn parent_of(&self, ino: u64) -> Result<u64, FsError> {
        if ino == ROOT_INO {
            return Ok(ROOT_INO);
        }
        let mut tr = self.read_tx();
        let prefix = keys::reverse_dir_prefix(ino);
        let key = tr.next_key(&prefix)?.ok_or(FsError::NotFound)?;
        if !belongs_to(&key, ino, keys::REVERSE_DIR_NAME2INODE) {
            return Err(FsError::NotFound);
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[prefix.len()..prefix.len() + 8]);
        Ok(u64::from_be_bytes(buf))
    }

    pub fn list_dir(&self, parent: u64) -> Result<Vec<(String, u64)>, FsError> {
        let mut tr = self.read_tx();
        let prefix = keys::dir_entry_prefix(parent);
        let mut out = Vec::new();
        let mut cursor = prefix.clone();
        loop {
            let next = tr.next_key(&cursor)?;
            let Some(key) = next else { break };
            if !belongs_to(&key, parent, keys::DIR_NAME2INODE) {
                break;
            }
            let bytes = tr.get(&key)?.ok_or(FsError::NotFound)?;
            let name = String::from_utf8_lossy(keys::dir_entry_name(&key)).into_owned();
            out.push((name, ino_from_bytes(&bytes)));
            cursor = key;
        }
        Ok(out)
    }

    /// Generates a fresh random ino, reprobing the tree (and the
    /// in-memory working set of the current transaction) on collision,
    /// exactly as `InodeTracker.CreateInode` does in the original.
    fn allocate_ino(&self, tr: &mut Transaction) -> Result<u64, FsError> {
        loop {
            let ino = rand::thread_rng().next_u64();
            if ino == 0 || ino == ROOT_INO {
                continue;
            }
            if tr.get(&keys::meta_key(ino))?.is_none() {
                return Ok(ino);
            }
        }
    }

    /// Creates a new child inode under `parent` with `meta`, linking it
    /// in as `name`. If `name` already exists: replaces it when
    /// `allow_replace`, otherwise fails with `AlreadyExists`.
    pub fn create_child(&self, parent: u64, name: &str, meta: InodeMeta, allow_replace: bool) -> Result<u64, FsError> {
        self.update(|tr| {
            let parent_meta_bytes = tr.get(&keys::meta_key(parent))?.ok_or(FsError::NotFound)?;
            let parent_meta = InodeMeta::deserialize(&parent_meta_bytes)?;
            if !parent_meta.is_dir() {
                return Err(FsError::NotDirectory);
            }

            let existing = tr.get(&keys::dir_entry_key(parent, name))?;
            if existing.is_some() {
                if !allow_replace {
                    return Err(FsError::AlreadyExists);
                }
                remove_child_locked(tr, parent, name)?;
            }

            let ino = self.allocate_ino(tr)?;
            tr.set(&keys::meta_key(ino), &meta.serialize())?;
            link_child_locked(tr, parent, name, ino)?;
            Ok(ino)
        })
    }

    /// Links an already-existing inode in as `name` under `parent`
    /// (POSIX `link`, and the second half of `rename`).
    pub fn link_existing(&self, parent: u64, name: &str, child: u64) -> Result<(), FsError> {
        self.update(|tr| {
            if tr.get(&keys::dir_entry_key(parent, name))?.is_some() {
                return Err(FsError::AlreadyExists);
            }
            link_child_locked(tr, parent, name, child)
        })
    }

    pub fn remove_child(&self, parent: u64, name: &str, want_dir: Option<bool>) -> Result<(), FsError> {
        self.update(|tr| {
            let bytes = tr.get(&keys::dir_entry_key(parent, name))?.ok_or(FsError::NotFound)?;
            let child = ino_from_bytes(&bytes);
            if let Some(want_dir) = want_dir {
                let child_meta_bytes = tr.get(&keys::meta_key(child))?.ok_or(FsError::NotFound)?;
                let child_meta = InodeMeta::deserialize(&child_meta_bytes)?;
                if child_meta.is_dir() != want_dir {
                    return Err(if want_dir { FsError::NotDirectory } else { FsError::IsDirectory });
                }
                if want_dir {
                    let has_children = tr.next_key(&keys::dir_entry_prefix(child))?
                        .map(|k| belongs_to(&k, child, keys::DIR_NAME2INODE))
                        .unwrap_or(false);
                    if has_children {
                        return Err(FsError::NotEmpty);
                    }
                }
            }
            remove_child_locked(tr, parent, name)
        })
    }

    // -- extended attributes --------------------------------------------

    pub fn get_xattr(&self, ino: u64, name: &str) -> Result<Vec<u8>, FsError> {
        let mut tr = self.read_tx();
        tr.get(&keys::xattr_key(ino, name))?.ok_or(FsError::NotFound)
    }

    pub fn set_xattr(&self, ino: u64, name: &str, value: &[u8]) -> Result<(), FsError> {
        self.update(|tr| {
            tr.set(&keys::xattr_key(ino, name), value)?;
            Ok(())
        })
    }

    pub fn remove_xattr(&self, ino: u64, name: &str) -> Result<(), FsError> {
        self.update(|tr| {
            if !tr.delete(&keys::xattr_key(ino, name))? {
                return Err(FsError::NotFound);
            }
            Ok(())
        })
    }

    pub fn list_xattr(&self, ino: u64) -> Result<Vec<Vec<u8>>, FsError> {
        let mut tr = self.read_tx();
        let prefix = keys::xattr_prefix(ino);
        let mut out = Vec::new();
        let mut cursor = prefix.clone();
        loop {
            let next = tr.next_key(&cursor)?;
            let Some(key) = next else { break };
            if !belongs_to(&key, ino, keys::XATTR) {
                break;
            }
            out.push(keys::xattr_name(ino, &key));
            cursor = key;
        }
        Ok(out)
    }

    // -- file data: chunked extents --------------------------------------

    pub fn read_data(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let mut tr = self.read_tx();
        let meta_bytes = tr.get(&keys::meta_key(ino))?.ok_or(FsError::NotFound)?;
        let meta = InodeMeta::deserialize(&meta_bytes)?;
        let end = offset.saturating_add(size as u64).min(meta.size);
        if offset >= end {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut chunk_start = (offset / EXTENT_CHUNK_SIZE) * EXTENT_CHUNK_SIZE;
        while chunk_start < end {
            let want_lo = offset.saturating_sub(chunk_start) as usize;
            let want_hi = (end - chunk_start).min(EXTENT_CHUNK_SIZE) as usize;
            let chunk = tr.get(&keys::extent_key(ino, chunk_start))?.unwrap_or_default();
            for i in want_lo..want_hi {
                out.push(chunk.get(i).copied().unwrap_or(0));
            }
            chunk_start += EXTENT_CHUNK_SIZE;
        }
        Ok(out)
    }

    pub fn write_data(&self, ino: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.update(|tr| {
            let meta_bytes = tr.get(&keys::meta_key(ino))?.ok_or(FsError::NotFound)?;
            let mut meta = InodeMeta::deserialize(&meta_bytes)?;

            let mut pos = offset;
            let mut written = 0usize;
            while written < data.len() {
                let chunk_start = (pos / EXTENT_CHUNK_SIZE) * EXTENT_CHUNK_SIZE;
                let offset_in_chunk = (pos - chunk_start) as usize;
                let room = (EXTENT_CHUNK_SIZE as usize) - offset_in_chunk;
                let take = room.min(data.len() - written);

                let mut chunk = tr
                    .get(&keys::extent_key(ino, chunk_start))?
                    .unwrap_or_else(|| vec![0u8; offset_in_chunk]);
                if chunk.len() < offset_in_chunk {
                    chunk.resize(offset_in_chunk, 0);
                }
                let end_in_chunk = offset_in_chunk + take;
                if chunk.len() < end_in_chunk {
                    chunk.resize(end_in_chunk, 0);
                }
                chunk[offset_in_chunk..end_in_chunk].copy_from_slice(&data[written..written + take]);
                tr.set(&keys::extent_key(ino, chunk_start), &chunk)?;

                pos += take as u64;
                written += take;
            }

            meta.size = meta.size.max(offset + data.len() as u64);
            meta.touch_mtime();
            tr.set(&keys::meta_key(ino), &meta.serialize())?;
            Ok(written as u32)
        })
    }

    pub fn truncate(&self, ino: u64, new_size: u64) -> Result<(), FsError> {
        self.update(|tr| {
            let meta_bytes = tr.get(&keys::meta_key(ino))?.ok_or(FsError::NotFound)?;
            let mut meta = InodeMeta::deserialize(&meta_bytes)?;
            if new_size < meta.size {
                let start = ((new_size / EXTENT_CHUNK_SIZE) * EXTENT_CHUNK_SIZE) + EXTENT_CHUNK_SIZE;
                tr.delete_range(&keys::extent_key(ino, start), &keys::extent_key(ino, u64::MAX))?;
                if new_size % EXTENT_CHUNK_SIZE != 0 {
                    let chunk_start = (new_size / EXTENT_CHUNK_SIZE) * EXTENT_CHUNK_SIZE;
                    if let Some(mut chunk) = tr.get(&keys::extent_key(ino, chunk_start))? {
                        let keep = (new_size - chunk_start) as usize;
                        chunk.truncate(keep);
                        tr.set(&keys::extent_key(ino, chunk_start), &chunk)?;
                    }
                }
            }
            meta.size = new_size;
            meta.touch_ctime();
            tr.set(&keys::meta_key(ino), &meta.serialize())?;
            Ok(())
        })
    }
}

fn ino_from_bytes(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

fn link_child_locked(tr: &mut Transaction, parent: u64, name: &str, child: u64) -> Result<(), FsError> {
    tr.set(&keys::dir_entry_key(parent, name), &child.to_be_bytes())?;
    tr.set(&keys::reverse_dir_key(child, parent, name), &[])?;

    let mut child_meta = InodeMeta::deserialize(&tr.get(&keys::meta_key(child))?.ok_or(FsError::NotFound)?)?;
    child_meta.nlink += 1;
    tr.set(&keys::meta_key(child), &child_meta.serialize())?;

    let mut parent_meta = InodeMeta::deserialize(&tr.get(&keys::meta_key(parent))?.ok_or(FsError::NotFound)?)?;
    parent_meta.touch_mtime();
    tr.set(&keys::meta_key(parent), &parent_meta.serialize())?;
    Ok(())
}

fn remove_child_locked(tr: &mut Transaction, parent: u64, name: &str) -> Result<(), FsError> {
    let bytes = tr.get(&keys::dir_entry_key(parent, name))?.ok_or(FsError::NotFound)?;
    let child = ino_from_bytes(&bytes);

    tr.delete(&keys::dir_entry_key(parent, name))?;
    tr.delete(&keys::reverse_dir_key(child, parent, name))?;

    let mut child_meta = InodeMeta::deserialize(&tr.get(&keys::meta_key(child))?.ok_or(FsError::NotFound)?)?;
    child_meta.nlink = child_meta.nlink.saturating_sub(1);
    tr.set(&keys::meta_key(child), &child_meta.serialize())?;

    let mut parent_meta = InodeMeta::deserialize(&tr.get(&keys::meta_key(parent))?.ok_or(FsError::NotFound)?)?;
    parent_meta.touch_mtime();
    tr.set(&keys::meta_key(parent), &parent_meta.serialize())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfhfs_block::InMemoryBlockBackend;
    use tfhfs_crypto::AesGcmEnvelope;

    fn test_fs() -> Fs {
        let salt = AesGcmEnvelope::generate_salt();
        let envelope = Box::new(AesGcmEnvelope::new(b"pw", &salt));
        let backend = Box::new(InMemoryBlockBackend::new());
        let storage = tfhfs_storage::spawn(backend, envelope, 1 << 20);
        Fs::new(storage).unwrap()
    }

    #[test]
    fn root_exists_after_format() {
        let fs = test_fs();
        let meta = fs.get_meta(ROOT_INO).unwrap();
        assert!(meta.is_dir());
    }

    #[test]
    fn create_lookup_and_list_round_trip() {
        let fs = test_fs();
        let meta = InodeMeta::new_file(libc::S_IFREG as u32 | 0o644, 1000, 1000);
        let ino = fs.create_child(ROOT_INO, "a.txt", meta, false).unwrap();
        assert_eq!(fs.lookup_child(ROOT_INO, "a.txt").unwrap(), ino);
        let entries = fs.list_dir(ROOT_INO).unwrap();
        assert!(entries.iter().any(|(n, i)| n == "a.txt" && *i == ino));
    }

    #[test]
    fn write_then_read_round_trips_across_chunk_boundary() {
        let fs = test_fs();
        let meta = InodeMeta::new_file(libc::S_IFREG as u32 | 0o644, 0, 0);
        let ino = fs.create_child(ROOT_INO, "big.bin", meta, false).unwrap();

        let data: Vec<u8> = (0..(EXTENT_CHUNK_SIZE as usize + 100)).map(|i| (i % 251) as u8).collect();
        fs.write_data(ino, 0, &data).unwrap();

        let back = fs.read_data(ino, 0, data.len() as u32).unwrap();
        assert_eq!(back, data);

        let meta = fs.get_meta(ino).unwrap();
        assert_eq!(meta.size, data.len() as u64);
    }

    #[test]
    fn rmdir_rejects_nonempty_directory() {
        let fs = test_fs();
        let dir_meta = InodeMeta::new_file(libc::S_IFDIR as u32 | 0o755, 0, 0);
        fs.create_child(ROOT_INO, "sub", dir_meta, false).unwrap();
        let sub = fs.lookup_child(ROOT_INO, "sub").unwrap();
        let file_meta = InodeMeta::new_file(libc::S_IFREG as u32 | 0o644, 0, 0);
        fs.create_child(sub, "x", file_meta, false).unwrap();

        let err = fs.remove_child(ROOT_INO, "sub", Some(true)).unwrap_err();
        assert!(matches!(err, FsError::NotEmpty));
    }

    #[test]
    fn xattr_set_list_remove_round_trips() {
        let fs = test_fs();
        fs.set_xattr(ROOT_INO, "user.note", b"hello").unwrap();
        assert_eq!(fs.get_xattr(ROOT_INO, "user.note").unwrap(), b"hello");
        assert!(fs.list_xattr(ROOT_INO).unwrap().contains(&b"user.note".to_vec()));
        fs.remove_xattr(ROOT_INO, "user.note").unwrap();
        assert!(fs.get_xattr(ROOT_INO, "user.note").is_err());
    }

    #[test]
    fn permission_check_matches_owner_group_world_and_root() {
        let meta = InodeMeta::new_file(libc::S_IFREG as u32 | 0o640, 100, 200);
        assert!(check_access(&meta, 0, 0, libc::R_OK | libc::W_OK, false));
        assert!(check_access(&meta, 100, 0, libc::R_OK | libc::W_OK, false));
        assert!(check_access(&meta, 0, 200, libc::R_OK, false));
        assert!(!check_access(&meta, 0, 200, libc::W_OK, false));
        assert!(!check_access(&meta, 999, 999, libc::R_OK, false));
        assert!(check_access(&meta, 100, 999, libc::R_OK, true));
    }
}
