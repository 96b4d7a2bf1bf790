//! Read and write engines: linear chain traversal, offset slicing within
//! blocks, allocation on growth and the per-open block caches.

use super::MyFs;
use crate::error::FsError;
use crate::layout::{BLOCK_FREE, BLOCK_SIZE, DATA_START, NO_BLOCK, NUM_DIR_ENTRIES};
use crate::util;
use log::debug;

impl MyFs {
    /// The directory slot a handle addresses, if it holds a live file.
    fn checked_slot(&self, handle: i64) -> Result<usize, FsError> {
        match usize::try_from(handle) {
            Ok(slot) if slot < NUM_DIR_ENTRIES && self.occupied[slot] => Ok(slot),
            _ => Err(FsError::BadHandle(handle)),
        }
    }

    /// Fetches a data block, served from the slot's read cache when the
    /// global last-read index matches.
    fn fetch_read(
        &mut self,
        slot: usize,
        block: i32,
        frame: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), FsError> {
        if block == self.last_block_read {
            frame.copy_from_slice(&self.read_frames[slot]);
            Ok(())
        } else {
            self.device.read(DATA_START + block as u32, frame)
        }
    }

    /// Fetches a data block, served from the slot's write cache when the
    /// global last-written index matches.
    fn fetch_write(
        &mut self,
        slot: usize,
        block: i32,
        frame: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), FsError> {
        if block == self.last_block_written {
            frame.copy_from_slice(&self.write_frames[slot]);
            Ok(())
        } else {
            self.device.read(DATA_START + block as u32, frame)
        }
    }

    /// Writes a data block and mirrors it into both of the slot's caches.
    fn commit_block(
        &mut self,
        slot: usize,
        block: i32,
        frame: &[u8; BLOCK_SIZE],
    ) -> Result<(), FsError> {
        self.device.write(DATA_START + block as u32, frame)?;
        self.read_frames[slot].copy_from_slice(frame);
        self.write_frames[slot].copy_from_slice(frame);
        self.last_block_read = block;
        self.last_block_written = block;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes at `offset` from the file behind
    /// `handle`. Returns the number of bytes copied, which is short when the
    /// request crosses the end of the file.
    pub fn read(
        &mut self,
        path: &str,
        buf: &mut [u8],
        offset: i64,
        handle: i64,
    ) -> Result<usize, FsError> {
        let slot = self.checked_slot(handle)?;
        let size = buf.len();
        let file_size = self.root[slot].size as u64;
        debug!("read `{path}`: {size} byte(s) at {offset}, handle {handle}");
        if size == 0 || file_size == 0 {
            return Ok(0);
        }
        if offset < 0 || offset as u64 > file_size {
            return Err(FsError::NoSuchAddress);
        }
        let offset = offset as u64;

        // Hop to the block holding the first requested byte.
        let mut block = self.root[slot].first_block;
        for _ in 0..offset / BLOCK_SIZE as u64 {
            if block < 0 || self.fat[block as usize] == NO_BLOCK {
                break;
            }
            block = self.fat[block as usize];
        }

        let first_tail = (offset % BLOCK_SIZE as u64) as usize;
        // Every data block the requested span touches.
        let mut blocks = (first_tail + size).div_ceil(BLOCK_SIZE);
        if file_size < BLOCK_SIZE as u64 {
            blocks = 1;
        }

        let mut frame = [0u8; BLOCK_SIZE];
        let mut copied = 0usize;
        let mut fetched = false;
        let mut j = 0usize;
        while (copied as u64) < file_size && block != NO_BLOCK && j < blocks {
            self.fetch_read(slot, block, &mut frame)?;
            fetched = true;

            let mut src = 0usize;
            let mut copy_size = BLOCK_SIZE;
            if j == 0 {
                src = first_tail;
                copy_size = BLOCK_SIZE - first_tail;
            }
            let file_tail = (file_size - offset) as usize - copied;
            if copy_size > file_tail {
                copy_size = file_tail;
            }
            if copy_size > size - copied {
                copy_size = size - copied;
            }
            buf[copied..copied + copy_size].copy_from_slice(&frame[src..src + copy_size]);
            copied += copy_size;
            self.last_block_read = block;
            block = self.fat[block as usize];
            j += 1;
        }
        if fetched {
            self.read_frames[slot].copy_from_slice(&frame);
        }
        self.root[slot].atime = util::timestamp();
        Ok(copied)
    }

    /// Writes `buf` at `offset` into the file behind `handle`. Returns the
    /// number of bytes stored, which is short once the byte budget or the
    /// allocation map runs out.
    pub fn write(
        &mut self,
        path: &str,
        buf: &[u8],
        offset: i64,
        handle: i64,
    ) -> Result<usize, FsError> {
        let slot = self.checked_slot(handle)?;
        let size = buf.len();
        let file_size = self.root[slot].size as u64;
        debug!("write `{path}`: {size} byte(s) at {offset}, handle {handle}");
        if size == 0 {
            return Ok(0);
        }
        if self.used_bytes >= self.superblock.fs_size {
            return Err(FsError::NoSpace);
        }
        if offset < 0 || offset as u64 > file_size {
            return Err(FsError::NoSuchAddress);
        }
        let offset = offset as u64;

        let written = if file_size == 0 && self.root[slot].first_block == NO_BLOCK {
            self.write_fresh(slot, buf, offset)?
        } else if offset == file_size {
            self.write_append(slot, buf, offset)?
        } else {
            self.write_over(slot, buf, offset)?
        };

        let now = util::timestamp();
        self.root[slot].atime = now;
        self.root[slot].mtime = now;
        self.flush_if_configured()?;
        Ok(written)
    }

    /// First write into an empty file: start a chain at offset 0.
    fn write_fresh(&mut self, slot: usize, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        if offset != 0 {
            return Err(FsError::NoSuchAddress);
        }
        let block = self.alloc_block();
        if block == NO_BLOCK {
            return Err(FsError::NoSpace);
        }
        self.root[slot].first_block = block;
        let written = self.fill_chain(slot, block, buf, 0)?;
        self.root[slot].size = written as u32;
        Ok(written)
    }

    /// Append at the exact end of file.
    fn write_append(&mut self, slot: usize, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let mut prev = NO_BLOCK;
        let mut block = self.root[slot].first_block;
        for _ in 0..offset / BLOCK_SIZE as u64 {
            if block < 0 {
                break;
            }
            prev = block;
            block = self.fat[block as usize];
        }

        let written = if block == NO_BLOCK {
            // The old size ends on a block boundary: open a fresh block.
            let fresh = self.alloc_block();
            if fresh == NO_BLOCK {
                return Err(FsError::NoSpace);
            }
            if prev >= 0 {
                self.fat[prev as usize] = fresh;
            } else {
                self.root[slot].first_block = fresh;
            }
            self.fill_chain(slot, fresh, buf, 0)?
        } else {
            // Fill the partial tail block first.
            let mut frame = [0u8; BLOCK_SIZE];
            self.fetch_write(slot, block, &mut frame)?;
            let tail = (offset % BLOCK_SIZE as u64) as usize;
            let mut copy_size = BLOCK_SIZE - tail;
            if copy_size > buf.len() {
                copy_size = buf.len();
            }
            let budget = (self.superblock.fs_size - self.used_bytes) as usize;
            if copy_size > budget {
                copy_size = budget;
            }
            frame[tail..tail + copy_size].copy_from_slice(&buf[..copy_size]);
            self.commit_block(slot, block, &frame)?;
            self.used_bytes += copy_size as u64;

            let mut written = copy_size;
            if written < buf.len() && self.used_bytes < self.superblock.fs_size {
                let fresh = self.alloc_block();
                if fresh != NO_BLOCK {
                    self.fat[block as usize] = fresh;
                    written = self.fill_chain(slot, fresh, buf, written)?;
                }
            }
            written
        };
        self.root[slot].size += written as u32;
        Ok(written)
    }

    /// Streams `buf[written..]` into the freshly allocated, unwritten
    /// `block` and further fresh blocks linked behind it. Accounts every
    /// byte against the budget and frees the pre-allocated successor the
    /// loop ends on.
    fn fill_chain(
        &mut self,
        slot: usize,
        mut block: i32,
        buf: &[u8],
        mut written: usize,
    ) -> Result<usize, FsError> {
        let mut last_written = NO_BLOCK;
        while written < buf.len() && self.used_bytes < self.superblock.fs_size && block != NO_BLOCK
        {
            let mut frame = [0u8; BLOCK_SIZE];
            let mut copy_size = BLOCK_SIZE;
            if copy_size > buf.len() - written {
                copy_size = buf.len() - written;
            }
            let budget = (self.superblock.fs_size - self.used_bytes) as usize;
            if copy_size > budget {
                copy_size = budget;
            }
            frame[..copy_size].copy_from_slice(&buf[written..written + copy_size]);
            self.commit_block(slot, block, &frame)?;
            self.used_bytes += copy_size as u64;
            written += copy_size;
            last_written = block;

            let next = self.alloc_block();
            self.fat[block as usize] = next;
            block = next;
        }
        if last_written != NO_BLOCK {
            let tail = self.fat[last_written as usize];
            if tail != NO_BLOCK {
                self.dmap[tail as usize] = BLOCK_FREE;
                self.fat[last_written as usize] = NO_BLOCK;
            }
        }
        Ok(written)
    }

    /// Overwrite inside existing content, growing past the old end when the
    /// input runs longer than the chain.
    fn write_over(&mut self, slot: usize, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let old_size = self.root[slot].size as u64;
        let mut block = self.root[slot].first_block;
        for _ in 0..offset / BLOCK_SIZE as u64 {
            if block < 0 {
                break;
            }
            block = self.fat[block as usize];
        }

        let size = buf.len();
        let mut frame = [0u8; BLOCK_SIZE];
        let mut written = 0usize;
        let mut grew = 0u32;
        // Block allocated by this pass but not yet written.
        let mut pending = NO_BLOCK;
        let mut last_written = NO_BLOCK;
        let mut j = 0usize;
        while written < size && self.used_bytes < self.superblock.fs_size && block != NO_BLOCK {
            if block == pending {
                frame = [0u8; BLOCK_SIZE];
                pending = NO_BLOCK;
            } else {
                self.fetch_write(slot, block, &mut frame)?;
            }

            let mut dst = 0usize;
            let mut copy_size = BLOCK_SIZE;
            if j == 0 {
                dst = (offset % BLOCK_SIZE as u64) as usize;
                copy_size = BLOCK_SIZE - dst;
            }
            if copy_size > size - written {
                copy_size = size - written;
            }
            let budget = (self.superblock.fs_size - self.used_bytes) as usize;
            if copy_size > budget {
                copy_size = budget;
            }
            frame[dst..dst + copy_size].copy_from_slice(&buf[written..written + copy_size]);
            self.commit_block(slot, block, &frame)?;

            // Only the bytes past the old end of file enlarge it.
            let pos = offset + written as u64;
            let end = pos + copy_size as u64;
            if end > old_size.max(pos) {
                let growth = end - old_size.max(pos);
                grew += growth as u32;
                self.used_bytes += growth;
            }
            written += copy_size;
            last_written = block;

            let mut next = self.fat[block as usize];
            if next == NO_BLOCK && written < size {
                next = self.alloc_block();
                self.fat[block as usize] = next;
                pending = next;
            }
            block = next;
            j += 1;
        }
        // Drop a grown block the loop never filled.
        if pending != NO_BLOCK && last_written != NO_BLOCK {
            self.dmap[pending as usize] = BLOCK_FREE;
            self.fat[last_written as usize] = NO_BLOCK;
        }
        self.root[slot].size += grew;
        Ok(written)
    }
}

#[cfg(test)]
mod test {
    use super::super::test::{empty_fixture, fixture};
    use super::*;
    use crate::config::MountConfig;
    use crate::layout::MAX_DATA_BYTES;
    use tempfile::tempdir;

    fn chain_len(fs: &MyFs, mut block: i32) -> usize {
        let mut len = 0;
        while block != NO_BLOCK {
            len += 1;
            block = fs.fat[block as usize];
        }
        len
    }

    #[test]
    fn create_write_read() {
        let (_dir, mut fs) = empty_fixture();
        fs.mknod("/a", libc::S_IFREG as u32 | 0o644).unwrap();
        let handle = fs.open("/a").unwrap() as i64;
        assert_eq!(fs.write("/a", b"hello", 0, handle).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(fs.read("/a", &mut buf, 0, handle).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        fs.release(handle).unwrap();
        assert_eq!(fs.getattr("/a").unwrap().size, 5);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 1);
        fs.assert_invariants();
    }

    #[test]
    fn multi_block_roundtrip() {
        let (_dir, mut fs) = empty_fixture();
        fs.mknod("/r", 0o644).unwrap();
        let handle = fs.open("/r").unwrap() as i64;
        let content: Vec<u8> = (0..1500u32).map(|i| (i % 233) as u8).collect();
        assert_eq!(fs.write("/r", &content, 0, handle).unwrap(), 1500);
        assert_eq!(fs.root[0].size, 1500);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 3);

        let mut buf = vec![0u8; 1500];
        assert_eq!(fs.read("/r", &mut buf, 0, handle).unwrap(), 1500);
        assert_eq!(buf, content);

        // An unaligned slice out of the middle.
        let mut buf = vec![0u8; 700];
        assert_eq!(fs.read("/r", &mut buf, 300, handle).unwrap(), 700);
        assert_eq!(buf, content[300..1000]);
        fs.assert_invariants();
    }

    #[test]
    fn overwrite_middle_across_blocks() {
        let (_dir, mut fs) = fixture(&[("a", &[b'A'; 1024])]);
        let handle = fs.open("/a").unwrap() as i64;
        assert_eq!(fs.write("/a", b"BB", 510, handle).unwrap(), 2);
        assert_eq!(fs.root[0].size, 1024);

        let mut buf = [0u8; 4];
        assert_eq!(fs.read("/a", &mut buf, 509, handle).unwrap(), 4);
        assert_eq!(&buf, b"ABBA");
        fs.assert_invariants();
    }

    #[test]
    fn append_across_block_boundary() {
        let (_dir, mut fs) = fixture(&[("x", &[b'X'; 510])]);
        let handle = fs.open("/x").unwrap() as i64;
        assert_eq!(fs.write("/x", b"YYYY", 510, handle).unwrap(), 4);
        assert_eq!(fs.root[0].size, 514);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 2);

        let mut buf = [0u8; 6];
        assert_eq!(fs.read("/x", &mut buf, 508, handle).unwrap(), 6);
        assert_eq!(&buf, b"XXYYYY");
        fs.assert_invariants();
    }

    #[test]
    fn append_after_exact_block() {
        let (_dir, mut fs) = fixture(&[("x", &[7u8; 512])]);
        let handle = fs.open("/x").unwrap() as i64;
        assert_eq!(fs.write("/x", &[9u8; 100], 512, handle).unwrap(), 100);
        assert_eq!(fs.root[0].size, 612);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 2);
        fs.assert_invariants();
    }

    #[test]
    fn exact_block_write_frees_the_spare() {
        let (_dir, mut fs) = empty_fixture();
        fs.mknod("/b", 0o644).unwrap();
        let handle = fs.open("/b").unwrap() as i64;
        assert_eq!(fs.write("/b", &[1u8; 512], 0, handle).unwrap(), 512);
        assert_eq!(fs.root[0].size, 512);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 1);
        // Exactly one data block stays allocated.
        assert_eq!(fs.dmap.iter().filter(|&&m| m == crate::layout::BLOCK_USED).count(), 1);
        fs.assert_invariants();
    }

    #[test]
    fn read_boundaries() {
        let (_dir, mut fs) = fixture(&[("a", b"abc")]);
        let handle = fs.open("/a").unwrap() as i64;
        let mut buf = [0u8; 8];

        // At end of file: zero bytes.
        assert_eq!(fs.read("/a", &mut buf, 3, handle).unwrap(), 0);
        // Past end, or negative: no such address.
        assert!(matches!(
            fs.read("/a", &mut buf, 4, handle),
            Err(FsError::NoSuchAddress)
        ));
        assert!(matches!(
            fs.read("/a", &mut buf, -1, handle),
            Err(FsError::NoSuchAddress)
        ));
        // Zero-sized requests succeed with nothing.
        assert_eq!(fs.read("/a", &mut [], 0, handle).unwrap(), 0);
    }

    #[test]
    fn empty_file_reads_nothing() {
        let (_dir, mut fs) = empty_fixture();
        fs.mknod("/e", 0o644).unwrap();
        let handle = fs.open("/e").unwrap() as i64;
        let mut buf = [0u8; 4];
        assert_eq!(fs.read("/e", &mut buf, 0, handle).unwrap(), 0);
    }

    #[test]
    fn bad_handles_are_rejected() {
        let (_dir, mut fs) = fixture(&[("a", b"abc")]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            fs.read("/a", &mut buf, 0, -1),
            Err(FsError::BadHandle(-1))
        ));
        assert!(matches!(
            fs.read("/a", &mut buf, 0, 64),
            Err(FsError::BadHandle(64))
        ));
        // Slot 5 holds no file.
        assert!(matches!(
            fs.write("/a", b"x", 0, 5),
            Err(FsError::BadHandle(5))
        ));
    }

    #[test]
    fn holes_cannot_be_written() {
        let (_dir, mut fs) = fixture(&[("a", b"abc")]);
        let handle = fs.open("/a").unwrap() as i64;
        assert!(matches!(
            fs.write("/a", b"x", 5, handle),
            Err(FsError::NoSuchAddress)
        ));
        assert!(matches!(
            fs.write("/a", b"x", -2, handle),
            Err(FsError::NoSuchAddress)
        ));
    }

    #[test]
    fn unlink_reclamation_reuses_freed_blocks() {
        let (_dir, mut fs) = fixture(&[
            ("a", &[b'a'; 1024]),
            ("b", &[b'b'; 1024]),
            ("c", &[b'c'; 1024]),
        ]);
        fs.unlink("/b").unwrap();
        fs.mknod("/d", 0o644).unwrap();
        let handle = fs.open("/d").unwrap() as i64;
        assert_eq!(fs.write("/d", &[b'd'; 1024], 0, handle).unwrap(), 1024);

        // The new chain sits in the blocks `b` gave back.
        let slot = fs.find_entry("d").unwrap();
        assert_eq!(fs.root[slot].first_block, 2);
        assert_eq!(fs.fat[2], 3);
        assert_eq!(fs.fat[3], NO_BLOCK);
        fs.assert_invariants();

        let mut buf = vec![0u8; 1024];
        assert_eq!(fs.read("/d", &mut buf, 0, handle).unwrap(), 1024);
        assert!(buf.iter().all(|&b| b == b'd'));
    }

    #[test]
    fn last_read_block_is_served_from_the_cache() {
        let (_dir, mut fs) = fixture(&[("a", b"hello")]);
        let handle = fs.open("/a").unwrap() as i64;
        let mut buf = [0u8; 5];
        fs.read("/a", &mut buf, 0, handle).unwrap();
        assert_eq!(&buf, b"hello");

        // Clobber the block on the device, behind the cache's back.
        let zeros = [0u8; BLOCK_SIZE];
        fs.device.write(DATA_START, &zeros).unwrap();

        // The cached frame still answers.
        let mut buf = [0u8; 5];
        fs.read("/a", &mut buf, 0, handle).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn overwrite_past_the_end_grows_the_file() {
        let (_dir, mut fs) = fixture(&[("q", &[b'Q'; 600])]);
        let handle = fs.open("/q").unwrap() as i64;
        let fresh: Vec<u8> = (0..600u32).map(|i| (i % 199) as u8).collect();
        assert_eq!(fs.write("/q", &fresh, 512, handle).unwrap(), 600);
        assert_eq!(fs.root[0].size, 1112);
        assert_eq!(chain_len(&fs, fs.root[0].first_block), 3);
        assert_eq!(fs.used_bytes, 1112);
        fs.assert_invariants();

        let mut buf = vec![0u8; 1112];
        assert_eq!(fs.read("/q", &mut buf, 0, handle).unwrap(), 1112);
        assert!(buf[..512].iter().all(|&b| b == b'Q'));
        assert_eq!(&buf[512..], &fresh[..]);
    }

    #[test]
    fn capacity_bound_clamps_and_then_refuses() {
        let dir = tempdir().unwrap();
        let big = dir.path().join("big");
        let file = std::fs::File::create(&big).unwrap();
        file.set_len(MAX_DATA_BYTES - 10).unwrap();
        let container = dir.path().join("container.bin");
        crate::builder::build_at(&container, &[big]).unwrap();

        let mut fs = MyFs::mount(MountConfig::new(container)).unwrap();
        let handle = fs.open("/big").unwrap() as i64;
        let offset = (MAX_DATA_BYTES - 10) as i64;
        assert_eq!(fs.write("/big", &[1u8; 20], offset, handle).unwrap(), 10);
        assert_eq!(fs.root[0].size as u64, MAX_DATA_BYTES);
        assert_eq!(fs.used_bytes, MAX_DATA_BYTES);

        assert!(matches!(
            fs.write("/big", &[1u8; 4], MAX_DATA_BYTES as i64, handle),
            Err(FsError::NoSpace)
        ));
        fs.assert_invariants();
    }
}
