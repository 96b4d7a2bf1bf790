//! The mounted filesystem: in-memory metadata and the operations on it.
//!
//! All state lives in RAM after mount; data blocks are written through to
//! the device immediately, metadata only at teardown (or after every
//! mutation with the `flush_on_mutation` option).

mod dispatch;
mod rw;

use crate::block::BlockDevice;
use crate::config::{FsOptions, MountConfig};
use crate::error::FsError;
use crate::layout::{
    self, DiskEntry, SuperBlock, BLOCK_FREE, BLOCK_SIZE, BLOCK_USED, DATA_BLOCKS, DMAP_BLOCKS,
    DMAP_START, FAT_BLOCKS, FAT_START, NO_BLOCK, NUM_DIR_ENTRIES, NUM_OPEN_FILES, ROOT_BLOCKS,
    ROOT_START, SUPER_BLOCK_START,
};
use crate::ops::{DirFiller, FileStat};
use crate::util;
use log::{debug, info, warn};
use std::mem::size_of;

/// In-memory image of one root-directory slot.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    pub size: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// First data block, or [`NO_BLOCK`] for an empty file.
    pub first_block: i32,
    /// Position in the open-file table, `-1` while closed.
    pub open_index: i16,
}

impl FileEntry {
    fn from_raw(raw: &DiskEntry) -> Self {
        Self {
            name: raw.name().to_owned(),
            size: raw.size,
            uid: raw.uid,
            gid: raw.gid,
            mode: raw.mode,
            atime: raw.atime,
            mtime: raw.mtime,
            ctime: raw.ctime,
            first_block: raw.first_block,
            open_index: raw.open_index,
        }
    }

    fn to_raw(&self) -> DiskEntry {
        let mut raw = DiskEntry::zeroed();
        raw.set_name(&self.name);
        raw.size = self.size;
        raw.uid = self.uid;
        raw.gid = self.gid;
        raw.mode = self.mode;
        raw.atime = self.atime;
        raw.mtime = self.mtime;
        raw.ctime = self.ctime;
        raw.first_block = self.first_block;
        raw.open_index = self.open_index;
        raw
    }
}

/// A mounted container. One instance owns the device and every table; the
/// bridge serializes calls, so no internal locking is needed.
pub struct MyFs {
    device: BlockDevice,
    superblock: SuperBlock,
    /// One mark per data block: [`BLOCK_FREE`] or [`BLOCK_USED`].
    dmap: Box<[u8]>,
    /// Next-block index per data block, [`NO_BLOCK`] at end of chain.
    fat: Box<[i32]>,
    root: Vec<FileEntry>,
    /// Which root slots currently hold a live file.
    occupied: [bool; NUM_DIR_ENTRIES],
    open_count: u16,
    /// Sum of all live file sizes, checked against the admission bound.
    used_bytes: u64,
    /// Index of the most recently read data block, across all files.
    last_block_read: i32,
    /// Index of the most recently written data block, across all files.
    last_block_written: i32,
    /// Per-slot copy of the last block read for that file.
    read_frames: Vec<[u8; BLOCK_SIZE]>,
    /// Per-slot copy of the last block written for that file.
    write_frames: Vec<[u8; BLOCK_SIZE]>,
    options: FsOptions,
}

/// Strips the leading `/` the bridge prepends to every path.
fn lookup_key(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

impl MyFs {
    /// Opens the container named by `config` and rebuilds all metadata in
    /// memory.
    pub fn mount(config: MountConfig) -> Result<Self, FsError> {
        let mut device = BlockDevice::open(&config.container)?;
        let mut frame = [0u8; BLOCK_SIZE];

        device.read(SUPER_BLOCK_START, &mut frame)?;
        let mut superblock = SuperBlock::zeroed();
        layout::raw_bytes_mut(&mut superblock)
            .copy_from_slice(&frame[..size_of::<SuperBlock>()]);
        if !superblock.has_expected_layout() {
            return Err(FsError::BadImage(format!(
                "unexpected region starts in {}",
                config.container.display()
            )));
        }
        if superblock.file_count as usize > NUM_DIR_ENTRIES {
            return Err(FsError::BadImage(format!(
                "file count {} exceeds the {NUM_DIR_ENTRIES} directory slots",
                superblock.file_count
            )));
        }

        let mut dmap = vec![0u8; DATA_BLOCKS].into_boxed_slice();
        for i in 0..DMAP_BLOCKS {
            device.read(DMAP_START + i, &mut frame)?;
            let off = i as usize * BLOCK_SIZE;
            dmap[off..off + BLOCK_SIZE].copy_from_slice(&frame);
        }

        let mut fat = vec![NO_BLOCK; DATA_BLOCKS].into_boxed_slice();
        for i in 0..FAT_BLOCKS {
            device.read(FAT_START + i, &mut frame)?;
            let off = i as usize * BLOCK_SIZE;
            layout::table_bytes_mut(&mut fat)[off..off + BLOCK_SIZE].copy_from_slice(&frame);
        }

        let mut root = Vec::with_capacity(NUM_DIR_ENTRIES);
        for i in 0..NUM_DIR_ENTRIES {
            device.read(ROOT_START + i as u32, &mut frame)?;
            let mut raw = DiskEntry::zeroed();
            layout::raw_bytes_mut(&mut raw).copy_from_slice(&frame[..size_of::<DiskEntry>()]);
            let mut entry = FileEntry::from_raw(&raw);
            // A fresh mount has no open files, whatever the image says.
            entry.open_index = -1;
            root.push(entry);
        }

        let mut occupied = [false; NUM_DIR_ENTRIES];
        let mut used_bytes = 0u64;
        for (i, flag) in occupied.iter_mut().enumerate() {
            *flag = (i as u32) < superblock.file_count;
            if *flag {
                used_bytes += root[i].size as u64;
            }
        }

        info!(
            "mounted {}: {} file(s), {used_bytes} byte(s) used",
            config.container.display(),
            superblock.file_count
        );
        Ok(Self {
            device,
            superblock,
            dmap,
            fat,
            root,
            occupied,
            open_count: 0,
            used_bytes,
            last_block_read: NO_BLOCK,
            last_block_written: NO_BLOCK,
            read_frames: vec![[0u8; BLOCK_SIZE]; NUM_OPEN_FILES],
            write_frames: vec![[0u8; BLOCK_SIZE]; NUM_OPEN_FILES],
            options: config.options,
        })
    }

    /// Slot of the occupied entry named `name`, if any.
    fn find_entry(&self, name: &str) -> Option<usize> {
        (0..NUM_DIR_ENTRIES).find(|&i| self.occupied[i] && self.root[i].name == name)
    }

    /// First unoccupied root slot.
    fn free_slot(&self) -> Option<usize> {
        (0..NUM_DIR_ENTRIES).find(|&i| !self.occupied[i])
    }

    /// Claims the first free data block: marks it used, terminates its chain
    /// entry and returns its index, or [`NO_BLOCK`] when the map is
    /// exhausted.
    fn alloc_block(&mut self) -> i32 {
        for i in 0..DATA_BLOCKS {
            if self.dmap[i] == BLOCK_FREE {
                self.dmap[i] = BLOCK_USED;
                self.fat[i] = NO_BLOCK;
                return i as i32;
            }
        }
        NO_BLOCK
    }

    /// Attributes of the root directory or of a file.
    pub fn getattr(&self, path: &str) -> Result<FileStat, FsError> {
        if path == "/" {
            return Ok(FileStat {
                mode: libc::S_IFDIR as u32 | 0o555,
                nlink: 2,
                uid: util::uid(),
                gid: util::gid(),
                ..FileStat::default()
            });
        }
        let name = lookup_key(path);
        let slot = self
            .find_entry(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_owned()))?;
        let entry = &self.root[slot];
        Ok(FileStat {
            mode: entry.mode,
            nlink: 1,
            uid: entry.uid,
            gid: entry.gid,
            size: entry.size as u64,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
        })
    }

    /// Creates an empty file owned by the calling process.
    pub fn mknod(&mut self, path: &str, mode: u32) -> Result<(), FsError> {
        let name = lookup_key(path);
        debug!("mknod `{name}` mode {mode:o}");
        if self.superblock.file_count as usize >= NUM_DIR_ENTRIES
            || self.used_bytes >= self.superblock.fs_size
        {
            return Err(FsError::NoSpace);
        }
        if self.find_entry(name).is_some() {
            return Err(FsError::Exists(name.to_owned()));
        }
        let slot = self.free_slot().ok_or(FsError::NoSpace)?;
        let now = util::timestamp();
        self.root[slot] = FileEntry {
            name: name.to_owned(),
            size: 0,
            uid: util::uid(),
            gid: util::gid(),
            mode,
            atime: now,
            mtime: now,
            ctime: now,
            first_block: NO_BLOCK,
            open_index: -1,
        };
        self.occupied[slot] = true;
        self.superblock.file_count += 1;
        self.flush_if_configured()
    }

    /// Removes a file and returns its data blocks to the allocation map.
    pub fn unlink(&mut self, path: &str) -> Result<(), FsError> {
        let name = lookup_key(path);
        let slot = self
            .find_entry(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_owned()))?;

        let mut block = self.root[slot].first_block;
        while block != NO_BLOCK {
            let next = self.fat[block as usize];
            self.fat[block as usize] = NO_BLOCK;
            self.dmap[block as usize] = BLOCK_FREE;
            block = next;
        }
        self.occupied[slot] = false;
        if self.root[slot].open_index >= 0 {
            self.root[slot].open_index = -1;
            self.open_count -= 1;
        }
        self.used_bytes -= self.root[slot].size as u64;
        if self.superblock.file_count > 0 {
            self.superblock.file_count -= 1;
        }
        // The freed blocks may be handed out again; a stale cache index must
        // not be able to claim them.
        self.last_block_read = NO_BLOCK;
        self.last_block_written = NO_BLOCK;
        debug!(
            "unlinked `{name}` from slot {slot}, {} file(s) remain",
            self.superblock.file_count
        );
        self.flush_if_configured()
    }

    /// Opens a file for the calling process and returns its slot index,
    /// which doubles as the file handle.
    pub fn open(&mut self, path: &str) -> Result<usize, FsError> {
        let name = lookup_key(path);
        if self.open_count as usize > NUM_OPEN_FILES {
            return Err(FsError::TooManyOpen);
        }
        let slot = self
            .find_entry(name)
            .ok_or_else(|| FsError::NoSuchEntry(name.to_owned()))?;
        let entry = &mut self.root[slot];
        let uid_match = util::uid() == entry.uid;
        let gid_match = util::gid() == entry.gid;
        let allowed = if self.options.strict_permission {
            uid_match && gid_match
        } else {
            uid_match || gid_match
        };
        if !allowed || entry.open_index >= 0 {
            return Err(FsError::PermissionDenied(name.to_owned()));
        }
        entry.open_index = self.open_count as i16;
        self.open_count += 1;
        debug!(
            "opened `{name}` as handle {slot}, {} file(s) open",
            self.open_count
        );
        Ok(slot)
    }

    /// Closes the file behind `handle`.
    pub fn release(&mut self, handle: i64) -> Result<(), FsError> {
        let Ok(slot) = usize::try_from(handle) else {
            return Err(FsError::NoSuchEntry(format!("handle {handle}")));
        };
        if slot >= NUM_DIR_ENTRIES || !self.occupied[slot] || self.root[slot].open_index < 0 {
            return Err(FsError::NoSuchEntry(format!("handle {handle}")));
        }
        self.root[slot].open_index = -1;
        self.open_count -= 1;
        debug!("released handle {slot}, {} file(s) open", self.open_count);
        Ok(())
    }

    /// Emits `.`, `..` and every live file name for the root directory.
    pub fn readdir(&self, path: &str, filler: &mut DirFiller) -> Result<(), FsError> {
        if path != "/" {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        for name in [".", ".."] {
            if filler(name) {
                debug!("readdir: reply buffer full at `{name}`");
            }
        }
        for i in 0..NUM_DIR_ENTRIES {
            if !self.occupied[i] {
                continue;
            }
            let name = self.root[i].name.as_str();
            if filler(name) {
                debug!("readdir: reply buffer full at `{name}`");
            }
        }
        Ok(())
    }

    /// Writes superblock, allocation map, chain table and all 64 root slots
    /// back to the container, then syncs it.
    ///
    /// Live entries are compacted to the front of the root region: the next
    /// mount derives occupancy from the file count alone, so the slots it
    /// reads must form a prefix.
    pub fn flush_metadata(&mut self) -> Result<(), FsError> {
        let mut frame = [0u8; BLOCK_SIZE];
        let sb = layout::raw_bytes(&self.superblock);
        frame[..sb.len()].copy_from_slice(sb);
        self.device.write(SUPER_BLOCK_START, &frame)?;

        for i in 0..DMAP_BLOCKS as usize {
            let off = i * BLOCK_SIZE;
            frame.copy_from_slice(&self.dmap[off..off + BLOCK_SIZE]);
            self.device.write(DMAP_START + i as u32, &frame)?;
        }
        for i in 0..FAT_BLOCKS as usize {
            let off = i * BLOCK_SIZE;
            frame.copy_from_slice(&layout::table_bytes(&self.fat)[off..off + BLOCK_SIZE]);
            self.device.write(FAT_START + i as u32, &frame)?;
        }
        let live: Vec<usize> = (0..NUM_DIR_ENTRIES).filter(|&i| self.occupied[i]).collect();
        let mut written = 0u32;
        for i in live {
            frame = [0u8; BLOCK_SIZE];
            let raw = self.root[i].to_raw();
            frame[..size_of::<DiskEntry>()].copy_from_slice(layout::raw_bytes(&raw));
            self.device.write(ROOT_START + written, &frame)?;
            written += 1;
        }
        let empty = [0u8; BLOCK_SIZE];
        for i in written..ROOT_BLOCKS {
            self.device.write(ROOT_START + i, &empty)?;
        }
        self.device.sync()?;
        debug!("metadata flushed, {written} root slot(s) in use");
        Ok(())
    }

    fn flush_if_configured(&mut self) -> Result<(), FsError> {
        if self.options.flush_on_mutation {
            self.flush_metadata()
        } else {
            Ok(())
        }
    }

    /// Teardown: persist metadata. Data blocks are already on the device.
    pub fn shutdown(&mut self) {
        if self.open_count > 0 {
            warn!("{} file(s) still open at teardown", self.open_count);
        }
        if let Err(e) = self.flush_metadata() {
            log::error!("metadata flush at teardown failed: {e}");
        }
    }
}

#[cfg(test)]
impl MyFs {
    /// Checks every structural invariant; panics on the first violation.
    pub(crate) fn assert_invariants(&self) {
        use std::collections::HashSet;

        let mut chained: HashSet<i32> = HashSet::new();
        let mut names: HashSet<&str> = HashSet::new();
        let mut live = 0u32;
        let mut size_sum = 0u64;
        for i in 0..NUM_DIR_ENTRIES {
            if !self.occupied[i] {
                continue;
            }
            let entry = &self.root[i];
            live += 1;
            size_sum += entry.size as u64;
            assert!(names.insert(&entry.name), "duplicate name `{}`", entry.name);

            let mut chain_len = 0u64;
            let mut block = entry.first_block;
            while block != NO_BLOCK {
                assert!(
                    chain_len < DATA_BLOCKS as u64,
                    "chain of `{}` does not terminate",
                    entry.name
                );
                assert!(
                    chained.insert(block),
                    "block {block} belongs to more than one chain"
                );
                assert_eq!(
                    self.dmap[block as usize], BLOCK_USED,
                    "chained block {block} is marked free"
                );
                chain_len += 1;
                block = self.fat[block as usize];
            }
            let span = chain_len * BLOCK_SIZE as u64;
            assert!(
                entry.size as u64 <= span,
                "`{}` larger than its chain",
                entry.name
            );
            if entry.size > 0 {
                assert!(
                    span - (entry.size as u64) < BLOCK_SIZE as u64,
                    "`{}` keeps a fully unused tail block",
                    entry.name
                );
            }
        }
        assert_eq!(self.superblock.file_count, live);
        assert_eq!(self.used_bytes, size_sum);
        assert!(self.open_count as usize <= NUM_OPEN_FILES);

        let marked: HashSet<i32> = (0..DATA_BLOCKS)
            .filter(|&i| self.dmap[i] == BLOCK_USED)
            .map(|i| i as i32)
            .collect();
        assert_eq!(marked, chained, "allocation map disagrees with the chains");
    }
}
