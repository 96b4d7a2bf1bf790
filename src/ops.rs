//! Callback surface consumed by the user-space filesystem bridge.
//!
//! The bridge dispatches file operations through a fixed vtable; this trait
//! is that vtable. Every method has a default body returning success without
//! side effects, so an implementation only overrides the operations it
//! actually supports. Paths arrive absolute with a leading `/`; results are
//! `0`, a positive byte count, or a negated errno.

use std::ffi::c_int;

/// File attributes reported by `getattr`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// Per-call open-file state. `open` publishes the directory slot index on
/// `handle`; `-1` means no file is attached.
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub handle: i64,
}

impl FileInfo {
    pub fn new() -> Self {
        Self { handle: -1 }
    }
}

impl Default for FileInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory emitter handed to `readdir`; returns `true` once the reply
/// buffer is full.
pub type DirFiller<'a> = dyn FnMut(&str) -> bool + 'a;

/// The operation vtable served to the bridge.
pub trait Filesystem {
    fn init(&mut self) -> c_int {
        0
    }

    fn destroy(&mut self) {}

    fn getattr(&mut self, _path: &str, _stat: &mut FileStat) -> c_int {
        0
    }

    fn mknod(&mut self, _path: &str, _mode: u32, _dev: u64) -> c_int {
        0
    }

    fn unlink(&mut self, _path: &str) -> c_int {
        0
    }

    fn open(&mut self, _path: &str, _fi: &mut FileInfo) -> c_int {
        0
    }

    /// Reads `buf.len()` bytes at `offset`; returns the byte count.
    fn read(&mut self, _path: &str, _buf: &mut [u8], _offset: i64, _fi: &mut FileInfo) -> c_int {
        0
    }

    /// Writes `buf` at `offset`; returns the byte count.
    fn write(&mut self, _path: &str, _buf: &[u8], _offset: i64, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn release(&mut self, _path: &str, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn readdir(&mut self, _path: &str, _filler: &mut DirFiller) -> c_int {
        0
    }

    // Namespace operations this filesystem does not provide. They succeed
    // without doing anything.

    fn readlink(&mut self, _path: &str, _buf: &mut [u8]) -> c_int {
        0
    }

    fn mkdir(&mut self, _path: &str, _mode: u32) -> c_int {
        0
    }

    fn rmdir(&mut self, _path: &str) -> c_int {
        0
    }

    fn symlink(&mut self, _path: &str, _link: &str) -> c_int {
        0
    }

    fn rename(&mut self, _path: &str, _newpath: &str) -> c_int {
        0
    }

    fn link(&mut self, _path: &str, _newpath: &str) -> c_int {
        0
    }

    fn chmod(&mut self, _path: &str, _mode: u32) -> c_int {
        0
    }

    fn chown(&mut self, _path: &str, _uid: u32, _gid: u32) -> c_int {
        0
    }

    fn truncate(&mut self, _path: &str, _size: i64) -> c_int {
        0
    }

    fn ftruncate(&mut self, _path: &str, _size: i64, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn utime(&mut self, _path: &str, _atime: i64, _mtime: i64) -> c_int {
        0
    }

    fn statfs(&mut self, _path: &str) -> c_int {
        0
    }

    fn flush(&mut self, _path: &str, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn fsync(&mut self, _path: &str, _datasync: bool, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn setxattr(&mut self, _path: &str, _name: &str, _value: &[u8], _flags: i32) -> c_int {
        0
    }

    fn getxattr(&mut self, _path: &str, _name: &str, _value: &mut [u8]) -> c_int {
        0
    }

    fn listxattr(&mut self, _path: &str, _list: &mut [u8]) -> c_int {
        0
    }

    fn removexattr(&mut self, _path: &str, _name: &str) -> c_int {
        0
    }

    fn opendir(&mut self, _path: &str, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn releasedir(&mut self, _path: &str, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn fsyncdir(&mut self, _path: &str, _datasync: bool, _fi: &mut FileInfo) -> c_int {
        0
    }

    fn create(&mut self, _path: &str, _mode: u32, _fi: &mut FileInfo) -> c_int {
        0
    }
}
