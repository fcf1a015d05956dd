//! A small path-walking user harness over `Fs`, standing in for a
//! real kernel mount in tests — the same role `FSUser` plays over the
//! original's raw fuse ops, minus the fuse wire types we can't build
//! outside a real mount.

#![allow(dead_code)]

use libc::{R_OK, W_OK, X_OK};

use tfhfs_block::InMemoryBlockBackend;
use tfhfs_crypto::AesGcmEnvelope;
use tfhfs_fs::{check_access, Fs, FsError, InodeMeta, ROOT_INO};

pub fn new_fs() -> Fs {
    let salt = AesGcmEnvelope::generate_salt();
    let envelope = Box::new(AesGcmEnvelope::new(b"hunter2", &salt));
    let backend = Box::new(InMemoryBlockBackend::new());
    let storage = tfhfs_storage::spawn(backend, envelope, 1 << 20);
    Fs::new(storage).expect("format a fresh store")
}

/// A simulated caller with fixed uid/gid, performing the same
/// permission checks the dispatcher would before each `Fs` call.
pub struct TestUser<'a> {
    pub fs: &'a Fs,
    pub uid: u32,
    pub gid: u32,
}

impl<'a> TestUser<'a> {
    pub fn new(fs: &'a Fs, uid: u32, gid: u32) -> Self {
        Self { fs, uid, gid }
    }

    fn require(&self, ino: u64, mode: i32) -> Result<InodeMeta, FsError> {
        let meta = self.fs.get_meta(ino)?;
        if check_access(&meta, self.uid, self.gid, mode, false) {
            Ok(meta)
        } else {
            Err(FsError::PermissionDenied)
        }
    }

    pub fn lookup_path(&self, path: &str) -> Result<u64, FsError> {
        let mut ino = ROOT_INO;
        for name in path.split('/').filter(|s| !s.is_empty()) {
            self.require(ino, X_OK)?;
            ino = self.fs.lookup_child(ino, name)?;
        }
        Ok(ino)
    }

    pub fn mkdir(&self, parent: &str, name: &str, mode: u32) -> Result<u64, FsError> {
        let parent_ino = self.lookup_path(parent)?;
        self.require(parent_ino, W_OK | X_OK)?;
        let meta = InodeMeta::new_file(libc::S_IFDIR as u32 | (mode & 0o7777), self.uid, self.gid);
        self.fs.create_child(parent_ino, name, meta, false)
    }

    pub fn create(&self, parent: &str, name: &str, mode: u32) -> Result<u64, FsError> {
        let parent_ino = self.lookup_path(parent)?;
        self.require(parent_ino, W_OK | X_OK)?;
        let meta = InodeMeta::new_file(libc::S_IFREG as u32 | (mode & 0o7777), self.uid, self.gid);
        self.fs.create_child(parent_ino, name, meta, false)
    }

    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        self.require(ino, W_OK)?;
        self.fs.write_data(ino, offset, data)
    }

    pub fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        self.require(ino, R_OK)?;
        self.fs.read_data(ino, offset, size)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<(String, u64)>, FsError> {
        let ino = self.lookup_path(path)?;
        self.require(ino, R_OK | X_OK)?;
        self.fs.list_dir(ino)
    }

    pub fn unlink(&self, parent: &str, name: &str) -> Result<(), FsError> {
        let parent_ino = self.lookup_path(parent)?;
        self.require(parent_ino, W_OK | X_OK)?;
        self.fs.remove_child(parent_ino, name, Some(false))
    }

    /// Mirrors the dispatcher's `setattr` mode gate: non-owners (other
    /// than root) are rejected with `EPERM`, and changing mode while
    /// outside the file's group strips setgid.
    pub fn chmod(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let ino = self.lookup_path(path)?;
        let mut meta = self.fs.get_meta(ino)?;
        if self.uid != 0 && self.uid != meta.uid {
            return Err(FsError::NotOwner);
        }
        meta.mode = (meta.mode & !0o7777) | (mode & 0o7777);
        if self.gid != meta.gid {
            meta.mode &= !(libc::S_ISGID as u32);
        }
        meta.touch_ctime();
        self.fs.set_meta(ino, meta)
    }

    pub fn rmdir(&self, parent: &str, name: &str) -> Result<(), FsError> {
        let parent_ino = self.lookup_path(parent)?;
        self.require(parent_ino, W_OK | X_OK)?;
        self.fs.remove_child(parent_ino, name, Some(true))
    }

    /// Mirrors the dispatcher's non-atomic rename: lookup source,
    /// unlink an existing destination, link under the new name, then
    /// unlink the old one.
    pub fn rename(&self, src_parent: &str, src_name: &str, dst_parent: &str, dst_name: &str) -> Result<(), FsError> {
        let src_parent_ino = self.lookup_path(src_parent)?;
        let dst_parent_ino = self.lookup_path(dst_parent)?;
        self.require(src_parent_ino, W_OK | X_OK)?;
        self.require(dst_parent_ino, W_OK | X_OK)?;

        let child = self.fs.lookup_child(src_parent_ino, src_name)?;
        if self.fs.lookup_child(dst_parent_ino, dst_name).is_ok() {
            self.fs.remove_child(dst_parent_ino, dst_name, None)?;
        }
        self.fs.link_existing(dst_parent_ino, dst_name, child)?;
        self.fs.remove_child(src_parent_ino, src_name, None)?;
        Ok(())
    }
}
