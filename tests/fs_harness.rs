//! Sanity checks for the `TestUser` harness itself: path walking,
//! directory creation, and the dispatcher-equivalent permission gate
//! it applies before every `Fs` call.

mod common;

use common::{new_fs, TestUser};
use tfhfs_fs::{FsError, ROOT_INO};

#[test]
fn root_resolves_to_root_ino() {
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    assert_eq!(user.lookup_path("").unwrap(), ROOT_INO);
}

#[test]
fn mkdir_then_lookup_path_resolves_nested_entry() {
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    user.mkdir("", "docs", 0o755).unwrap();
    user.create("docs", "readme.txt", 0o644).unwrap();
    let ino = user.lookup_path("docs/readme.txt").unwrap();
    assert!(ino != ROOT_INO);
}

#[test]
fn non_owner_without_world_bits_is_denied_traversal() {
    let fs = new_fs();
    let owner = TestUser::new(&fs, 1000, 1000);
    owner.mkdir("", "private", 0o700).unwrap();
    owner.create("private", "secret.txt", 0o600).unwrap();

    let stranger = TestUser::new(&fs, 2000, 2000);
    let err = stranger.lookup_path("private/secret.txt").unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied));
}
