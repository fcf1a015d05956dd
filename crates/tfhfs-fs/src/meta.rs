//! Inode metadata: the value stored under a `META` key.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use tfhfs_ibtree::{TreeError, TreeValue};

/// `(seconds, nanoseconds)` since the epoch — stable across platforms,
/// unlike serializing `SystemTime` directly.
pub type StoredTime = (i64, u32);

pub fn now_stored() -> StoredTime {
    let dur = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    (dur.as_secs() as i64, dur.subsec_nanos())
}

pub fn stored_to_system(t: StoredTime) -> SystemTime {
    if t.0 >= 0 {
        UNIX_EPOCH + std::time::Duration::new(t.0 as u64, t.1)
    } else {
        UNIX_EPOCH - std::time::Duration::new((-t.0) as u64, t.1)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InodeMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub rdev: u32,
    pub atime: StoredTime,
    pub mtime: StoredTime,
    pub ctime: StoredTime,
    /// Symlink target, empty for every other file kind.
    pub symlink_target: Vec<u8>,
}

impl InodeMeta {
    pub fn new_file(mode: u32, uid: u32, gid: u32) -> Self {
        let now = now_stored();
        Self {
            mode,
            uid,
            gid,
            size: 0,
            nlink: 1,
            rdev: 0,
            atime: now,
            mtime: now,
            ctime: now,
            symlink_target: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFLNK as u32
    }

    pub fn touch_mtime(&mut self) {
        let now = now_stored();
        self.mtime = now;
        self.ctime = now;
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = now_stored();
    }
}

impl TreeValue for InodeMeta {
    fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("InodeMeta serialization never fails for owned data")
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, TreeError> {
        bincode::deserialize(bytes).map_err(|_| TreeError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_tree_value() {
        let meta = InodeMeta::new_file(libc::S_IFREG as u32 | 0o644, 1000, 1000);
        let bytes = meta.serialize();
        let back = InodeMeta::deserialize(&bytes).unwrap();
        assert_eq!(back.mode, meta.mode);
        assert_eq!(back.uid, 1000);
    }

    #[test]
    fn is_dir_and_is_symlink_read_the_type_bits() {
        let dir = InodeMeta::new_file(libc::S_IFDIR as u32 | 0o755, 0, 0);
        assert!(dir.is_dir());
        let link = InodeMeta::new_file(libc::S_IFLNK as u32 | 0o777, 0, 0);
        assert!(link.is_symlink());
    }
}
