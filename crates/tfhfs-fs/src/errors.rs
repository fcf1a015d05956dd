//! Filesystem-level errors and their `errno` mapping.
//!
//! The dispatcher is the only layer that ever translates into
//! `errno` — everything below (`tfhfs_ibtree`, `tfhfs_storage`) stays
//! in its own typed error world and never sees `libc`.

use thiserror::Error;

use tfhfs_ibtree::TreeError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("file exists")]
    AlreadyExists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("operation not permitted")]
    NotOwner,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no space left on device")]
    NoSpace,
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl FsError {
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EACCES,
            FsError::NotOwner => libc::EPERM,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NoSpace => libc::ENOSPC,
            FsError::Tree(_) => libc::EIO,
        }
    }
}
