//! Routes the bridge's callback vtable into the filesystem service.
//!
//! Each implemented operation unwraps the typed result into the `0`, byte
//! count or negated-errno convention the bridge expects. Operations without
//! an override keep the trait's succeed-and-do-nothing default.

use super::MyFs;
use crate::ops::{DirFiller, FileInfo, FileStat, Filesystem};
use log::{error, info};
use std::ffi::c_int;

impl Filesystem for MyFs {
    fn init(&mut self) -> c_int {
        info!("service attached");
        0
    }

    fn destroy(&mut self) {
        self.shutdown();
    }

    fn getattr(&mut self, path: &str, stat: &mut FileStat) -> c_int {
        match MyFs::getattr(self, path) {
            Ok(attrs) => {
                *stat = attrs;
                0
            }
            Err(e) => e.errno(),
        }
    }

    fn mknod(&mut self, path: &str, mode: u32, _dev: u64) -> c_int {
        match MyFs::mknod(self, path, mode) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    fn unlink(&mut self, path: &str) -> c_int {
        match MyFs::unlink(self, path) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }

    fn open(&mut self, path: &str, fi: &mut FileInfo) -> c_int {
        fi.handle = -1;
        match MyFs::open(self, path) {
            Ok(slot) => {
                fi.handle = slot as i64;
                0
            }
            Err(e) => e.errno(),
        }
    }

    fn read(&mut self, path: &str, buf: &mut [u8], offset: i64, fi: &mut FileInfo) -> c_int {
        match MyFs::read(self, path, buf, offset, fi.handle) {
            Ok(n) => n as c_int,
            Err(e) => e.errno(),
        }
    }

    fn write(&mut self, path: &str, buf: &[u8], offset: i64, fi: &mut FileInfo) -> c_int {
        match MyFs::write(self, path, buf, offset, fi.handle) {
            Ok(n) => n as c_int,
            Err(e) => e.errno(),
        }
    }

    fn release(&mut self, _path: &str, fi: &mut FileInfo) -> c_int {
        match MyFs::release(self, fi.handle) {
            Ok(()) => 0,
            Err(e) => {
                error!("release of handle {} failed: {e}", fi.handle);
                e.errno()
            }
        }
    }

    fn readdir(&mut self, path: &str, filler: &mut DirFiller) -> c_int {
        match MyFs::readdir(self, path, filler) {
            Ok(()) => 0,
            Err(e) => e.errno(),
        }
    }
}
