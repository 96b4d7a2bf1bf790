//! Fixed-size block access to the container file.

use crate::error::FsError;
use crate::layout::{BLOCK_SIZE, CONTAINER_BYTES, TOTAL_BLOCKS};
use log::debug;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::path::Path;

/// Random-access store of 512-byte blocks over a single host file.
///
/// The file is closed when the device is dropped; [`BlockDevice::close`]
/// additionally forces the data down to the host filesystem.
pub struct BlockDevice {
    file: std::fs::File,
}

impl BlockDevice {
    /// Creates (or truncates) the container at `path`, sized for the full
    /// region layout.
    pub fn create(path: &Path) -> Result<Self, FsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(CONTAINER_BYTES)?;
        debug!("created container {} ({CONTAINER_BYTES} bytes)", path.display());
        Ok(Self { file })
    }

    /// Attaches to an existing container at `path`.
    pub fn open(path: &Path) -> Result<Self, FsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    FsError::NotFound(path.display().to_string())
                } else {
                    FsError::Io(e)
                }
            })?;
        Ok(Self { file })
    }

    /// Reads block `block` into `buf`.
    pub fn read(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), FsError> {
        self.seek_to(block)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Writes `buf` to block `block`.
    pub fn write(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), FsError> {
        self.seek_to(block)?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Flushes everything written so far down to the host filesystem.
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Syncs and closes the device.
    pub fn close(mut self) -> Result<(), FsError> {
        self.sync()
    }

    fn seek_to(&mut self, block: u32) -> Result<(), FsError> {
        if block >= TOTAL_BLOCKS {
            return Err(FsError::OutOfRange(block));
        }
        self.file
            .seek(SeekFrom::Start(block as u64 * BLOCK_SIZE as u64))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_the_container() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("container.bin");
        let dev = BlockDevice::create(&path).unwrap();
        drop(dev);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), CONTAINER_BYTES);
    }

    #[test]
    fn block_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("container.bin");
        let mut dev = BlockDevice::create(&path).unwrap();

        let mut frame = [0u8; BLOCK_SIZE];
        frame[0] = 0xab;
        frame[BLOCK_SIZE - 1] = 0xcd;
        dev.write(0, &frame).unwrap();
        dev.write(TOTAL_BLOCKS - 1, &frame).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        dev.read(TOTAL_BLOCKS - 1, &mut out).unwrap();
        assert_eq!(out, frame);
        dev.read(0, &mut out).unwrap();
        assert_eq!(out, frame);
        dev.close().unwrap();
    }

    #[test]
    fn out_of_range_blocks_are_rejected() {
        let dir = tempdir().unwrap();
        let mut dev = BlockDevice::create(&dir.path().join("container.bin")).unwrap();
        let mut frame = [0u8; BLOCK_SIZE];
        assert!(matches!(
            dev.read(TOTAL_BLOCKS, &mut frame),
            Err(FsError::OutOfRange(_))
        ));
        assert!(matches!(
            dev.write(u32::MAX, &frame),
            Err(FsError::OutOfRange(_))
        ));
    }

    #[test]
    fn open_missing_container() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.bin");
        assert!(matches!(
            BlockDevice::open(&missing),
            Err(FsError::NotFound(_))
        ));
    }
}
