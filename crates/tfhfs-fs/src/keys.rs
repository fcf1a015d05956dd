//! Tree key encoding: `ino (8B BE) ++ subtype (1B) ++ subtype-data`.
//!
//! This is the only key producer the tree ever sees, which is why
//! `tfhfs_ibtree` fixes its key type to this byte layout instead of
//! carrying a generic `TreeKey` trait.

use fnv::FnvHasher;
use std::hash::Hasher;

pub const META: u8 = 0x00;
pub const DIR_NAME2INODE: u8 = 0x01;
pub const REVERSE_DIR_NAME2INODE: u8 = 0x02;
pub const XATTR: u8 = 0x03;
pub const EXTENT: u8 = 0x04;

/// 64-bit FNV-1a, used to keep directory-entry keys roughly balanced
/// across the B+tree regardless of how many entries share a name
/// prefix.
pub fn fnv64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

fn key_prefix(ino: u64, subtype: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.extend_from_slice(&ino.to_be_bytes());
    key.push(subtype);
    key
}

pub fn meta_key(ino: u64) -> Vec<u8> {
    key_prefix(ino, META)
}

pub fn dir_entry_prefix(parent: u64) -> Vec<u8> {
    key_prefix(parent, DIR_NAME2INODE)
}

pub fn dir_entry_key(parent: u64, name: &str) -> Vec<u8> {
    let mut key = dir_entry_prefix(parent);
    key.extend_from_slice(&fnv64(name.as_bytes()).to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Recovers the entry name from a `DIR_NAME2INODE` key, stripping the
/// ino/subtype/hash prefix.
pub fn dir_entry_name(key: &[u8]) -> &[u8] {
    &key[9 + 8..]
}

pub fn reverse_dir_prefix(child: u64) -> Vec<u8> {
    key_prefix(child, REVERSE_DIR_NAME2INODE)
}

pub fn reverse_dir_key(child: u64, parent: u64, name: &str) -> Vec<u8> {
    let mut key = reverse_dir_prefix(child);
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn xattr_prefix(ino: u64) -> Vec<u8> {
    key_prefix(ino, XATTR)
}

pub fn xattr_key(ino: u64, name: &str) -> Vec<u8> {
    let mut key = xattr_prefix(ino);
    key.extend_from_slice(name.as_bytes());
    key
}

pub fn xattr_name(ino: u64, key: &[u8]) -> Vec<u8> {
    key[xattr_prefix(ino).len()..].to_vec()
}

pub fn extent_prefix(ino: u64) -> Vec<u8> {
    key_prefix(ino, EXTENT)
}

pub fn extent_key(ino: u64, offset: u64) -> Vec<u8> {
    let mut key = extent_prefix(ino);
    key.extend_from_slice(&offset.to_be_bytes());
    key
}

pub fn extent_offset(ino: u64, key: &[u8]) -> u64 {
    let prefix_len = extent_prefix(ino).len();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[prefix_len..prefix_len + 8]);
    u64::from_be_bytes(buf)
}

/// Whether `key` still belongs to `(ino, subtype)` — the same "does
/// this NextKey still belong to the subtree I'm walking" check the
/// original's `ReadNextInode` performs after every `NextKey` call.
pub fn belongs_to(key: &[u8], ino: u64, subtype: u8) -> bool {
    key.len() >= 9 && &key[..8] == ino.to_be_bytes().as_slice() && key[8] == subtype
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_key_round_trips_name() {
        let key = dir_entry_key(7, "hello.txt");
        assert!(belongs_to(&key, 7, DIR_NAME2INODE));
        assert_eq!(dir_entry_name(&key), b"hello.txt");
    }

    #[test]
    fn extent_key_round_trips_offset() {
        let key = extent_key(42, 8192);
        assert_eq!(extent_offset(42, &key), 8192);
    }

    #[test]
    fn belongs_to_rejects_other_ino_or_subtype() {
        let key = meta_key(5);
        assert!(!belongs_to(&key, 6, META));
        assert!(belongs_to(&key, 5, META));
        assert!(!belongs_to(&dir_entry_key(5, "x"), 5, META));
    }
}
