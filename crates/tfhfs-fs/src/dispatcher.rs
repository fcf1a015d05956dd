//! The `fuser::Filesystem` implementation. This is the wire-protocol
//! adapter layer: it translates FUSE requests into calls against
//! `Fs`, and `Fs`'s `Result<_, FsError>` back into `errno` replies.
//! Methods the distilled operation list doesn't name (`flush`,
//! `fsync`, `fsyncdir`, `fallocate`, and friends) reply `ENOSYS`,
//! matching the original dispatcher's explicit stub list.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::{ENOSYS, R_OK, W_OK, X_OK};

use crate::errors::FsError;
use crate::inode::{check_access, Fs, EXTENT_CHUNK_SIZE};
use crate::meta::{stored_to_system, InodeMeta};

/// How long the kernel may cache an entry/attr before re-validating.
/// Short because this filesystem has no out-of-band invalidation
/// channel back to the kernel.
const TTL: Duration = Duration::from_secs(1);
const GENERATION: u64 = 0;

pub struct Dispatcher {
    fs: Fs,
}

impl Dispatcher {
    pub fn new(fs: Fs) -> Self {
        Self { fs }
    }

    fn attr_of(&self, ino: u64, meta: &InodeMeta) -> FileAttr {
        FileAttr {
            ino,
            size: meta.size,
            blocks: meta.size.div_ceil(EXTENT_CHUNK_SIZE),
            atime: stored_to_system(meta.atime),
            mtime: stored_to_system(meta.mtime),
            ctime: stored_to_system(meta.ctime),
            crtime: stored_to_system(meta.ctime),
            kind: file_type(meta.mode),
            perm: (meta.mode & 0o7777) as u16,
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            rdev: meta.rdev,
            blksize: EXTENT_CHUNK_SIZE as u32,
            flags: 0,
        }
    }

    fn access_check(&self, ino: u64, uid: u32, gid: u32, mode: i32, or_own: bool) -> Result<InodeMeta, FsError> {
        let meta = self.fs.get_meta(ino)?;
        if check_access(&meta, uid, gid, mode, or_own) {
            Ok(meta)
        } else {
            Err(FsError::PermissionDenied)
        }
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

impl Filesystem for Dispatcher {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(u64, InodeMeta), FsError> {
            self.access_check(parent, req.uid(), req.gid(), X_OK, false)?;
            let ino = self.fs.lookup_child(parent, &name)?;
            let meta = self.fs.get_meta(ino)?;
            Ok((ino, meta))
        })();

        match result {
            Ok((ino, meta)) => {
                self.fs.tracker.lock().unwrap().lookup_ref(ino);
                reply.entry(&TTL, &self.attr_of(ino, &meta), GENERATION);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.tracker.lock().unwrap().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.get_meta(ino) {
            Ok(meta) => reply.attr(&TTL, &self.attr_of(ino, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let uid_req = req.uid();
        let gid_req = req.gid();
        let result = (|| -> Result<InodeMeta, FsError> {
            let mut meta = self.fs.get_meta(ino)?;
            let is_root = uid_req == 0;
            let is_owner = uid_req == meta.uid;

            // Only root may change uid; doing so clears setuid/setgid
            // (the file no longer carries the old owner's privilege).
            if let Some(u) = uid {
                if !is_root {
                    return Err(FsError::NotOwner);
                }
                meta.uid = u;
                meta.mode &= !(libc::S_ISUID | libc::S_ISGID) as u32;
            }

            // Non-owners may not chmod at all; a chmod issued by someone
            // outside the file's group (root acting on another user's
            // file) strips setgid, mirroring chmod(2)'s non-member rule.
            if let Some(m) = mode {
                if !is_root && !is_owner {
                    return Err(FsError::NotOwner);
                }
                meta.mode = (meta.mode & !0o7777) | (m & 0o7777);
                if gid_req != meta.gid {
                    meta.mode &= !libc::S_ISGID as u32;
                }
            }

            // Non-owners may chgrp only as root; an owner may only hand
            // the file to a group they themselves belong to.
            if let Some(g) = gid {
                if !is_root && (!is_owner || g != gid_req) {
                    return Err(FsError::NotOwner);
                }
                meta.gid = g;
            }

            if size.is_some() || atime.is_some() || mtime.is_some() {
                self.access_check(ino, uid_req, gid_req, W_OK, true)?;
            }
            if let Some(sz) = size {
                self.fs.truncate(ino, sz)?;
                meta.size = sz;
            }
            if let Some(TimeOrNow::SpecificTime(t)) = atime {
                meta.atime = system_to_stored(t);
            }
            if let Some(TimeOrNow::SpecificTime(t)) = mtime {
                meta.mtime = system_to_stored(t);
            }
            meta.touch_ctime();
            self.fs.set_meta(ino, meta.clone())?;
            Ok(meta)
        })();

        match result {
            Ok(meta) => reply.attr(&TTL, &self.attr_of(ino, &meta)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.get_meta(ino) {
            Ok(meta) if meta.is_symlink() => reply.data(&meta.symlink_target),
            Ok(_) => reply.error(libc::EINVAL),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(u64, InodeMeta), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            let mut meta = InodeMeta::new_file(mode, req.uid(), req.gid());
            meta.rdev = rdev;
            let ino = self.fs.create_child(parent, &name, meta, false)?;
            let meta = self.fs.get_meta(ino)?;
            Ok((ino, meta))
        })();

        match result {
            Ok((ino, meta)) => reply.entry(&TTL, &self.attr_of(ino, &meta), GENERATION),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(u64, InodeMeta), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            let meta = InodeMeta::new_file(libc::S_IFDIR as u32 | (mode & 0o7777), req.uid(), req.gid());
            let ino = self.fs.create_child(parent, &name, meta, false)?;
            let meta = self.fs.get_meta(ino)?;
            Ok((ino, meta))
        })();

        match result {
            Ok((ino, meta)) => reply.entry(&TTL, &self.attr_of(ino, &meta), GENERATION),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            self.fs.remove_child(parent, &name, Some(false))
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            self.fs.remove_child(parent, &name, Some(true))
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(&mut self, req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        let name = link_name.to_string_lossy();
        let target = target.to_string_lossy().into_owned().into_bytes();
        let result = (|| -> Result<(u64, InodeMeta), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            let mut meta = InodeMeta::new_file(libc::S_IFLNK as u32 | 0o777, req.uid(), req.gid());
            meta.size = target.len() as u64;
            meta.symlink_target = target;
            let ino = self.fs.create_child(parent, &name, meta, false)?;
            let meta = self.fs.get_meta(ino)?;
            Ok((ino, meta))
        })();

        match result {
            Ok((ino, meta)) => reply.entry(&TTL, &self.attr_of(ino, &meta), GENERATION),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    /// Non-atomic: lookup old, unlink new (if present), link new name,
    /// unlink old name. A documented departure from POSIX rename
    /// atomicity carried over unchanged from the original, not fixed
    /// here — see the crate-level design notes.
    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        let newname = newname.to_string_lossy();
        let result = (|| -> Result<(), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, true)?;
            let child = self.fs.lookup_child(parent, &name)?;

            self.access_check(newparent, req.uid(), req.gid(), W_OK | X_OK, true)?;
            if self.fs.lookup_child(newparent, &newname).is_ok() {
                self.fs.remove_child(newparent, &newname, None)?;
            }

            self.fs.link_existing(newparent, &newname, child)?;
            if parent != newparent || name != newname {
                self.fs.remove_child(parent, &name, None)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(&mut self, req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let newname = newname.to_string_lossy();
        let result = (|| -> Result<InodeMeta, FsError> {
            self.access_check(newparent, req.uid(), req.gid(), W_OK | X_OK, true)?;
            self.fs.link_existing(newparent, &newname, ino)?;
            self.fs.get_meta(ino)
        })();

        match result {
            Ok(meta) => reply.entry(&TTL, &self.attr_of(ino, &meta), GENERATION),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let want_write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let mode = if want_write { R_OK | W_OK } else { R_OK };
        match self.access_check(ino, req.uid(), req.gid(), mode, false) {
            Ok(_) => {
                if flags & libc::O_TRUNC != 0 {
                    if let Err(e) = self.fs.truncate(ino, 0) {
                        reply.error(e.to_errno());
                        return;
                    }
                }
                let fh = self.fs.tracker.lock().unwrap().open(ino);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read_data(ino, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write_data(ino, offset.max(0) as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.tracker.lock().unwrap().close(fh);
        reply.ok();
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.access_check(ino, req.uid(), req.gid(), R_OK | X_OK, false) {
            Ok(_) => {
                let fh = self.fs.tracker.lock().unwrap().open(ino);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let mut entries = vec![(".".to_string(), ino, FileType::Directory)];
        match self.fs.lookup_child(ino, "..") {
            Ok(parent) => entries.push(("..".to_string(), parent, FileType::Directory)),
            Err(_) => entries.push(("..".to_string(), ino, FileType::Directory)),
        }

        let children = match self.fs.list_dir(ino) {
            Ok(c) => c,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        for (name, child_ino) in children {
            let kind = match self.fs.get_meta(child_ino) {
                Ok(meta) => file_type(meta.mode),
                Err(_) => FileType::RegularFile,
            };
            entries.push((name, child_ino, kind));
        }

        for (i, (name, child_ino, kind)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(child_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.fs.tracker.lock().unwrap().close(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let (used, avail) = self.fs.backend_stats();
        let bsize = EXTENT_CHUNK_SIZE as u32;
        let to_blocks = |bytes: i64| if bytes < 0 { u64::MAX / 2 } else { bytes as u64 / bsize as u64 };
        let free = to_blocks(avail);
        let total = free + to_blocks(used);
        let files = self.fs.tracker.lock().unwrap().tracked_count() as u64;
        reply.statfs(total, free, free, files, u64::MAX - files, bsize, 255, bsize);
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(), FsError> {
            self.access_check(ino, req.uid(), req.gid(), W_OK, true)?;
            self.fs.set_xattr(ino, &name, value)
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getxattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<Vec<u8>, FsError> {
            self.access_check(ino, req.uid(), req.gid(), R_OK, false)?;
            self.fs.get_xattr(ino, &name)
        })();
        match result {
            Ok(data) if size == 0 => reply.size(data.len() as u32),
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = (|| -> Result<Vec<u8>, FsError> {
            self.access_check(ino, req.uid(), req.gid(), R_OK, false)?;
            let names = self.fs.list_xattr(ino)?;
            let mut buf = Vec::new();
            for n in names {
                buf.extend_from_slice(&n);
                buf.push(0);
            }
            Ok(buf)
        })();
        match result {
            Ok(buf) if size == 0 => reply.size(buf.len() as u32),
            Ok(buf) => reply.data(&buf),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_string_lossy();
        let result = (|| -> Result<(), FsError> {
            self.access_check(ino, req.uid(), req.gid(), W_OK, true)?;
            self.fs.remove_xattr(ino, &name)
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.access_check(ino, req.uid(), req.gid(), mask, false) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_string_lossy();
        let allow_replace = flags & libc::O_EXCL == 0;
        let result = (|| -> Result<(u64, InodeMeta), FsError> {
            self.access_check(parent, req.uid(), req.gid(), W_OK | X_OK, false)?;
            let meta = InodeMeta::new_file(libc::S_IFREG as u32 | (mode & 0o7777), req.uid(), req.gid());
            let ino = self.fs.create_child(parent, &name, meta, allow_replace)?;
            let meta = self.fs.get_meta(ino)?;
            Ok((ino, meta))
        })();

        match result {
            Ok((ino, meta)) => {
                let fh = self.fs.tracker.lock().unwrap().open(ino);
                reply.created(&TTL, &self.attr_of(ino, &meta), GENERATION, fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.error(ENOSYS);
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.error(ENOSYS);
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.error(ENOSYS);
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(ENOSYS);
    }
}

fn system_to_stored(t: SystemTime) -> (i64, u32) {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(e) => (-(e.duration().as_secs() as i64), e.duration().subsec_nanos()),
    }
}
