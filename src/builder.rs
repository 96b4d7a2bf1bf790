//! Offline image builder: packs a set of host files into a freshly
//! formatted container.
//!
//! Files are laid out front to back in consecutive data blocks; the chain
//! table is still written for every file so the mounted filesystem can grow
//! or free them later without caring how they were placed.

use crate::block::BlockDevice;
use crate::error::FsError;
use crate::layout::{
    self, DiskEntry, SuperBlock, BLOCK_FREE, BLOCK_SIZE, BLOCK_USED, DATA_BLOCKS, DATA_START,
    DMAP_START, FAT_START, FILE_NAME_MAX_LENGTH, MAX_DATA_BYTES, NO_BLOCK, NUM_DIR_ENTRIES,
    ROOT_START, SUPER_BLOCK_START,
};
use crate::util;
use log::{debug, info};
use std::fs::File;
use std::io;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The container file name the builder insists on.
pub const CONTAINER_NAME: &str = "container.bin";

/// Why a build was refused.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("no input files were provided")]
    NoFiles,
    #[error("{0} input files were provided, at most {max} are allowed", max = NUM_DIR_ENTRIES)]
    TooManyFiles(usize),
    #[error("`{0}` names the container file")]
    ContainerReused(String),
    #[error("`{0}` and `{1}` would represent the same file")]
    DuplicateName(String, String),
    #[error("file name `{0}` is longer than {max} bytes", max = FILE_NAME_MAX_LENGTH)]
    NameTooLong(String),
    #[error("`{0}` has no usable file name")]
    BadName(String),
    #[error("cannot open `{path}` for reading: {source}")]
    Unreadable { path: String, source: io::Error },
    #[error("input files exceed the {max} byte capacity by {excess} byte(s)")]
    TooLarge { excess: u64, max: u64 },
    #[error(transparent)]
    Device(#[from] FsError),
}

impl BuildError {
    /// Process exit code for the CLI: `-1` for validation failures, the
    /// negated host errno for I/O failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unreadable { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
            Self::Device(e) => e.errno(),
            _ => -1,
        }
    }
}

/// How one input file was placed into the container.
#[derive(Debug)]
pub struct PackedFile {
    pub name: String,
    pub size: u32,
    /// First data block, or [`NO_BLOCK`] for an empty file.
    pub first_block: i32,
    /// Number of data blocks used.
    pub blocks: u32,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildReport {
    /// Where the container was actually written.
    pub container: PathBuf,
    pub superblock: SuperBlock,
    pub files: Vec<PackedFile>,
}

/// Applies the container naming rule: any argument other than the literal
/// `container.bin` is replaced by a fresh `container.bin` in the working
/// directory.
pub fn resolve_container(arg: &Path) -> PathBuf {
    if arg == Path::new(CONTAINER_NAME) {
        arg.to_path_buf()
    } else {
        PathBuf::from(CONTAINER_NAME)
    }
}

/// Validates the inputs and packs them into a container, applying the
/// container naming rule first.
pub fn build(container_arg: &Path, inputs: &[PathBuf]) -> Result<BuildReport, BuildError> {
    build_at(&resolve_container(container_arg), inputs)
}

/// Validates the inputs and packs them into a container at exactly `container`.
pub fn build_at(container: &Path, inputs: &[PathBuf]) -> Result<BuildReport, BuildError> {
    let names = validate(inputs)?;

    let mut device = BlockDevice::create(container)?;
    let mut superblock = SuperBlock::default();
    let mut dmap = vec![BLOCK_FREE; DATA_BLOCKS];
    let mut fat = vec![NO_BLOCK; DATA_BLOCKS];
    let mut entries = Vec::with_capacity(inputs.len());
    let mut files = Vec::with_capacity(inputs.len());

    // Next free data block; allocation is a simple forward cursor.
    let mut cursor: u32 = 0;
    for (input, name) in inputs.iter().zip(&names) {
        let (entry, used) = pack_file(&mut device, input, name, cursor, &mut dmap, &mut fat)?;
        debug!("packed `{name}`: {} bytes in {used} block(s)", entry.size);
        files.push(PackedFile {
            name: name.clone(),
            size: entry.size,
            first_block: entry.first_block,
            blocks: used,
        });
        cursor += used;
        superblock.file_count += 1;
        entries.push(entry);
    }

    persist(&mut device, &superblock, &dmap, &fat, &entries)?;
    device.close()?;
    info!(
        "built {} with {} file(s) in {cursor} data block(s)",
        container.display(),
        superblock.file_count
    );

    Ok(BuildReport {
        container: container.to_path_buf(),
        superblock,
        files,
    })
}

/// Runs the ordered input checks and returns the container-internal name of
/// every input.
fn validate(inputs: &[PathBuf]) -> Result<Vec<String>, BuildError> {
    if inputs.is_empty() {
        return Err(BuildError::NoFiles);
    }
    if inputs.len() > NUM_DIR_ENTRIES {
        return Err(BuildError::TooManyFiles(inputs.len()));
    }

    let mut names = Vec::with_capacity(inputs.len());
    for input in inputs {
        let name = util::basename(input)
            .ok_or_else(|| BuildError::BadName(input.display().to_string()))?;
        if name == CONTAINER_NAME {
            return Err(BuildError::ContainerReused(input.display().to_string()));
        }
        names.push(name.to_owned());
    }
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            if a == b {
                return Err(BuildError::DuplicateName(a.clone(), b.clone()));
            }
        }
    }
    for name in &names {
        if name.len() > FILE_NAME_MAX_LENGTH {
            return Err(BuildError::NameTooLong(name.clone()));
        }
    }

    let mut total: u64 = 0;
    for input in inputs {
        let file = File::open(input).map_err(|source| BuildError::Unreadable {
            path: input.display().to_string(),
            source,
        })?;
        total += file
            .metadata()
            .map_err(|source| BuildError::Unreadable {
                path: input.display().to_string(),
                source,
            })?
            .len();
    }
    if total > MAX_DATA_BYTES {
        return Err(BuildError::TooLarge {
            excess: total - MAX_DATA_BYTES,
            max: MAX_DATA_BYTES,
        });
    }

    Ok(names)
}

/// Streams one host file into the data region starting at `cursor` and
/// returns its directory entry together with the number of blocks used.
fn pack_file(
    device: &mut BlockDevice,
    input: &Path,
    name: &str,
    cursor: u32,
    dmap: &mut [u8],
    fat: &mut [i32],
) -> Result<(DiskEntry, u32), BuildError> {
    let mut file = File::open(input).map_err(|source| BuildError::Unreadable {
        path: input.display().to_string(),
        source,
    })?;
    let meta = file.metadata().map_err(FsError::Io)?;

    let mut used: u32 = 0;
    let mut last_len = 0usize;
    loop {
        let mut frame = [0u8; BLOCK_SIZE];
        let n = read_block(&mut file, &mut frame).map_err(FsError::Io)?;
        if n == 0 {
            break;
        }
        let block = cursor + used;
        device.write(DATA_START + block, &frame)?;
        dmap[block as usize] = BLOCK_USED;
        fat[block as usize] = block as i32 + 1;
        used += 1;
        last_len = n;
        if n < BLOCK_SIZE {
            break;
        }
    }

    let mut entry = DiskEntry::zeroed();
    entry.set_name(name);
    if used == 0 {
        entry.first_block = NO_BLOCK;
        entry.size = 0;
    } else {
        fat[(cursor + used - 1) as usize] = NO_BLOCK;
        entry.first_block = cursor as i32;
        entry.size = if last_len == BLOCK_SIZE {
            used * BLOCK_SIZE as u32
        } else {
            (used - 1) * BLOCK_SIZE as u32 + last_len as u32
        };
    }
    entry.uid = util::uid();
    entry.gid = util::gid();
    entry.mode = libc::S_IFREG as u32 | 0o444;
    entry.atime = meta.atime();
    entry.mtime = meta.mtime();
    entry.ctime = meta.ctime();
    entry.open_index = -1;
    Ok((entry, used))
}

/// Fills `frame` from `file`, tolerating short reads; returns the number of
/// bytes placed in the frame (0 at end of file).
fn read_block(file: &mut File, frame: &mut [u8; BLOCK_SIZE]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < BLOCK_SIZE {
        let n = file.read(&mut frame[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Writes all metadata regions in order: superblock, allocation map, chain
/// table, then the occupied root slots.
fn persist(
    device: &mut BlockDevice,
    superblock: &SuperBlock,
    dmap: &[u8],
    fat: &[i32],
    entries: &[DiskEntry],
) -> Result<(), FsError> {
    let mut frame = [0u8; BLOCK_SIZE];
    let sb = layout::raw_bytes(superblock);
    frame[..sb.len()].copy_from_slice(sb);
    device.write(SUPER_BLOCK_START, &frame)?;

    for (i, chunk) in dmap.chunks_exact(BLOCK_SIZE).enumerate() {
        frame.copy_from_slice(chunk);
        device.write(DMAP_START + i as u32, &frame)?;
    }
    for (i, chunk) in layout::table_bytes(fat).chunks_exact(BLOCK_SIZE).enumerate() {
        frame.copy_from_slice(chunk);
        device.write(FAT_START + i as u32, &frame)?;
    }
    for (i, entry) in entries.iter().enumerate() {
        frame = [0u8; BLOCK_SIZE];
        let raw = layout::raw_bytes(entry);
        frame[..raw.len()].copy_from_slice(raw);
        device.write(ROOT_START + i as u32, &frame)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layout::raw_bytes_mut;
    use std::io::Write;
    use tempfile::{tempdir, TempDir};

    fn host_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content).unwrap();
        path
    }

    fn read_entry(device: &mut BlockDevice, slot: u32) -> DiskEntry {
        let mut frame = [0u8; BLOCK_SIZE];
        device.read(ROOT_START + slot, &mut frame).unwrap();
        let mut entry = DiskEntry::zeroed();
        let len = std::mem::size_of::<DiskEntry>();
        raw_bytes_mut(&mut entry).copy_from_slice(&frame[..len]);
        entry
    }

    #[test]
    fn container_naming_rule() {
        assert_eq!(
            resolve_container(Path::new("container.bin")),
            PathBuf::from("container.bin")
        );
        assert_eq!(
            resolve_container(Path::new("image.bin")),
            PathBuf::from("container.bin")
        );
        assert_eq!(
            resolve_container(Path::new("some/dir/container.bin")),
            PathBuf::from("container.bin")
        );
    }

    #[test]
    fn packs_files_front_to_back() {
        let dir = tempdir().unwrap();
        let big: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let inputs = vec![
            host_file(&dir, "big.dat", &big),
            host_file(&dir, "small.txt", b"tiny"),
        ];
        let container = dir.path().join("container.bin");
        let report = build_at(&container, &inputs).unwrap();

        assert_eq!(report.superblock.file_count, 2);
        assert_eq!(report.files[0].first_block, 0);
        assert_eq!(report.files[0].blocks, 2);
        assert_eq!(report.files[0].size, 1000);
        assert_eq!(report.files[1].first_block, 2);
        assert_eq!(report.files[1].blocks, 1);
        assert_eq!(report.files[1].size, 4);

        let mut device = BlockDevice::open(&container).unwrap();
        let mut frame = [0u8; BLOCK_SIZE];

        // Superblock block.
        device.read(SUPER_BLOCK_START, &mut frame).unwrap();
        let mut sb = SuperBlock::zeroed();
        let len = std::mem::size_of::<SuperBlock>();
        raw_bytes_mut(&mut sb).copy_from_slice(&frame[..len]);
        assert!(sb.has_expected_layout());
        assert_eq!(sb.fs_size, MAX_DATA_BYTES);
        assert_eq!(sb.file_count, 2);

        // Allocation map: three used blocks, the rest free.
        device.read(DMAP_START, &mut frame).unwrap();
        assert_eq!(&frame[..4], &[BLOCK_USED, BLOCK_USED, BLOCK_USED, BLOCK_FREE]);

        // Chain table: 0 -> 1 -> end, 2 -> end.
        device.read(FAT_START, &mut frame).unwrap();
        let mut fat = [0i32; BLOCK_SIZE / 4];
        crate::layout::table_bytes_mut(&mut fat).copy_from_slice(&frame);
        assert_eq!(fat[0], 1);
        assert_eq!(fat[1], NO_BLOCK);
        assert_eq!(fat[2], NO_BLOCK);

        // Directory entries.
        let entry = read_entry(&mut device, 0);
        assert_eq!(entry.name(), "big.dat");
        assert_eq!(entry.size, 1000);
        assert_eq!(entry.first_block, 0);
        assert_eq!(entry.mode, libc::S_IFREG as u32 | 0o444);
        assert_eq!(entry.uid, util::uid());
        assert_eq!(entry.open_index, -1);
        let entry = read_entry(&mut device, 1);
        assert_eq!(entry.name(), "small.txt");

        // Data region contents.
        device.read(DATA_START, &mut frame).unwrap();
        assert_eq!(&frame[..], &big[..BLOCK_SIZE]);
        device.read(DATA_START + 1, &mut frame).unwrap();
        assert_eq!(&frame[..1000 - BLOCK_SIZE], &big[BLOCK_SIZE..]);
        assert_eq!(frame[1000 - BLOCK_SIZE..].iter().max(), Some(&0));
        device.read(DATA_START + 2, &mut frame).unwrap();
        assert_eq!(&frame[..4], b"tiny");
    }

    #[test]
    fn empty_files_get_no_blocks() {
        let dir = tempdir().unwrap();
        let inputs = vec![
            host_file(&dir, "empty", b""),
            host_file(&dir, "one", b"1"),
        ];
        let container = dir.path().join("container.bin");
        let report = build_at(&container, &inputs).unwrap();
        assert_eq!(report.files[0].first_block, NO_BLOCK);
        assert_eq!(report.files[0].size, 0);
        assert_eq!(report.files[0].blocks, 0);
        // The next file still starts at block 0.
        assert_eq!(report.files[1].first_block, 0);
    }

    #[test]
    fn rejects_empty_input_set() {
        let dir = tempdir().unwrap();
        let container = dir.path().join("container.bin");
        assert!(matches!(build_at(&container, &[]), Err(BuildError::NoFiles)));
    }

    #[test]
    fn rejects_too_many_files() {
        let dir = tempdir().unwrap();
        let inputs: Vec<PathBuf> = (0..NUM_DIR_ENTRIES + 1)
            .map(|i| host_file(&dir, &format!("f{i}"), b"x"))
            .collect();
        let container = dir.path().join("container.bin");
        assert!(matches!(
            build_at(&container, &inputs),
            Err(BuildError::TooManyFiles(65))
        ));
    }

    #[test]
    fn rejects_duplicate_basenames() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let a = host_file(&dir, "same", b"a");
        let b = sub.join("same");
        std::fs::write(&b, b"b").unwrap();
        let container = dir.path().join("container.bin");
        assert!(matches!(
            build_at(&container, &[a, b]),
            Err(BuildError::DuplicateName(..))
        ));
    }

    #[test]
    fn rejects_container_as_input() {
        let dir = tempdir().unwrap();
        let input = host_file(&dir, "container.bin", b"x");
        let container = dir.path().join("out.bin");
        assert!(matches!(
            build_at(&container, &[input]),
            Err(BuildError::ContainerReused(_))
        ));
    }

    #[test]
    fn rejects_overlong_names() {
        let dir = tempdir().unwrap();
        let input = host_file(&dir, &"n".repeat(FILE_NAME_MAX_LENGTH + 1), b"x");
        let container = dir.path().join("container.bin");
        assert!(matches!(
            build_at(&container, &[input]),
            Err(BuildError::NameTooLong(_))
        ));
    }

    #[test]
    fn rejects_unreadable_input() {
        let dir = tempdir().unwrap();
        let container = dir.path().join("container.bin");
        let missing = dir.path().join("missing");
        assert!(matches!(
            build_at(&container, &[missing]),
            Err(BuildError::Unreadable { .. })
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge");
        let file = File::create(&path).unwrap();
        file.set_len(MAX_DATA_BYTES + 1).unwrap();
        let container = dir.path().join("container.bin");
        match build_at(&container, &[path]) {
            Err(BuildError::TooLarge { excess, .. }) => assert_eq!(excess, 1),
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }
}
