//! Error type shared by the block device, the builder and the service.

use std::io;
use thiserror::Error;

/// Errors surfaced by the filesystem and mapped onto the errno values the
/// bridge reports to callers.
#[derive(Error, Debug)]
pub enum FsError {
    /// No directory entry carries the requested name.
    #[error("no such file: `{0}`")]
    NoSuchEntry(String),
    /// The requested name is already taken by another entry.
    #[error("file exists: `{0}`")]
    Exists(String),
    /// Directory slots, data blocks or the byte budget are exhausted.
    #[error("no space left in container")]
    NoSpace,
    /// The open-file table is full.
    #[error("too many open files")]
    TooManyOpen,
    /// Caller identity does not match the entry, or the file is already open.
    #[error("permission denied: `{0}`")]
    PermissionDenied(String),
    /// The file handle does not address a directory slot.
    #[error("bad file handle: {0}")]
    BadHandle(i64),
    /// Offset past end of file, negative, or an attempt to leave a hole.
    #[error("no such address")]
    NoSuchAddress,
    /// A directory listing was requested for something that is not the root.
    #[error("not a directory: `{0}`")]
    NotADirectory(String),
    /// A block index outside the container geometry.
    #[error("block {0} out of range")]
    OutOfRange(u32),
    /// The container file does not exist.
    #[error("container not found: `{0}`")]
    NotFound(String),
    /// The container exists but its metadata does not describe this layout.
    #[error("invalid container image: {0}")]
    BadImage(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    /// The negated errno the bridge expects for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NoSuchEntry(_) | Self::NotFound(_) => -libc::ENOENT,
            Self::Exists(_) => -libc::EEXIST,
            Self::NoSpace => -libc::ENOSPC,
            Self::TooManyOpen => -libc::EMFILE,
            Self::PermissionDenied(_) => -libc::EACCES,
            Self::BadHandle(_) => -libc::EBADF,
            Self::NoSuchAddress => -libc::ENXIO,
            Self::NotADirectory(_) => -libc::ENOTDIR,
            Self::OutOfRange(_) | Self::BadImage(_) => -libc::EIO,
            Self::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
