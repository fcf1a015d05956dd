//! End-to-end scenarios driven through the `TestUser` harness instead
//! of a real kernel mount, covering the properties a round trip
//! through an actual FUSE session would also have to satisfy.

mod common;

use common::{new_fs, TestUser};
use tfhfs_fs::{FsError, ROOT_INO};

#[test]
fn create_write_read_round_trips() {
    let fs = new_fs();
    let user = TestUser::new(&fs, 1000, 1000);

    let ino = user.create("", "greeting.txt", 0o644).unwrap();
    let written = user.write(ino, 0, b"hello, tfhfs").unwrap();
    assert_eq!(written as usize, b"hello, tfhfs".len());

    let back = user.read(ino, 0, 64).unwrap();
    assert_eq!(back, b"hello, tfhfs");
}

#[test]
fn directory_listing_includes_dot_and_dotdot_when_synthesized() {
    // `Fs::list_dir` itself only returns real entries; `.`/`..` are
    // synthesized one layer up (by the dispatcher's `readdir`), the
    // same split the original's `ReadDir` vs `ListDir` maintains.
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    user.mkdir("", "sub", 0o755).unwrap();
    let sub_ino = user.lookup_path("sub").unwrap();

    let mut synthesized: Vec<(String, u64)> = vec![
        (".".to_string(), sub_ino),
        ("..".to_string(), ROOT_INO),
    ];
    synthesized.extend(user.list_dir("sub").unwrap());

    assert!(synthesized.iter().any(|(n, i)| n == "." && *i == sub_ino));
    assert!(synthesized.iter().any(|(n, i)| n == ".." && *i == ROOT_INO));
}

#[test]
fn rename_moves_entry_across_directories() {
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    user.mkdir("", "from", 0o755).unwrap();
    user.mkdir("", "to", 0o755).unwrap();
    let ino = user.create("from", "x.bin", 0o644).unwrap();

    user.rename("from", "x.bin", "to", "x.bin").unwrap();

    assert!(user.lookup_path("from/x.bin").is_err());
    assert_eq!(user.lookup_path("to/x.bin").unwrap(), ino);
}

#[test]
fn xattr_set_list_remove_round_trips_through_fs() {
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    let ino = user.create("", "tagged.bin", 0o644).unwrap();

    fs.set_xattr(ino, "user.checksum", b"deadbeef").unwrap();
    assert_eq!(fs.get_xattr(ino, "user.checksum").unwrap(), b"deadbeef");
    assert!(fs.list_xattr(ino).unwrap().contains(&b"user.checksum".to_vec()));

    fs.remove_xattr(ino, "user.checksum").unwrap();
    assert!(matches!(fs.get_xattr(ino, "user.checksum").unwrap_err(), FsError::NotFound));
}

#[test]
fn unlinked_but_open_file_stays_readable() {
    // No orphan-reclamation pass runs on unlink (matching the
    // original's lack of one) — the META entry and its extents stay
    // addressable by ino as long as something still holds it, exactly
    // as a POSIX unlink-while-open file stays readable through its
    // existing file descriptor.
    let fs = new_fs();
    let user = TestUser::new(&fs, 0, 0);
    let ino = user.create("", "scratch.bin", 0o644).unwrap();
    user.write(ino, 0, b"still here after unlink").unwrap();
    let fh = fs.tracker.lock().unwrap().open(ino);

    user.unlink("", "scratch.bin").unwrap();

    assert!(user.lookup_path("scratch.bin").is_err());
    let data = user.read(ino, 0, 64).unwrap();
    assert_eq!(data, b"still here after unlink");

    fs.tracker.lock().unwrap().close(fh);
}

#[test]
fn chmod_by_non_owner_is_eperm_but_root_succeeds() {
    let fs = new_fs();
    let owner = TestUser::new(&fs, 1000, 1000);
    owner.create("", "owned.bin", 0o644).unwrap();

    let stranger = TestUser::new(&fs, 1001, 1001);
    assert!(matches!(stranger.chmod("owned.bin", 0o777).unwrap_err(), FsError::NotOwner));

    let root = TestUser::new(&fs, 0, 0);
    root.chmod("owned.bin", 0o777).unwrap();
    assert_eq!(owner.fs.get_meta(owner.lookup_path("owned.bin").unwrap()).unwrap().mode & 0o7777, 0o777);
}

#[test]
fn permission_check_rejects_then_accepts_across_owner_boundary() {
    let fs = new_fs();
    let owner = TestUser::new(&fs, 1000, 1000);
    let ino = owner.create("", "owned.bin", 0o600).unwrap();

    let stranger = TestUser::new(&fs, 2000, 2000);
    assert!(matches!(stranger.read(ino, 0, 16).unwrap_err(), FsError::PermissionDenied));

    owner.fs.set_meta(ino, {
        let mut meta = owner.fs.get_meta(ino).unwrap();
        meta.mode = (meta.mode & !0o777) | 0o644;
        meta
    }).unwrap();

    assert!(stranger.read(ino, 0, 16).is_ok());
}
