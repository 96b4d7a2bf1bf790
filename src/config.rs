//! Mount-time configuration handed over by the bridge adapter.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;

/// Behavior switches for a mounted filesystem. Both default to off, which
/// reproduces the historical permissive behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOptions {
    /// Require the caller's UID *and* GID to match an entry on `open`,
    /// instead of either one.
    pub strict_permission: bool,
    /// Flush superblock, allocation map, chain table and root directory to
    /// the container after every successful mutation, not only at teardown.
    pub flush_on_mutation: bool,
}

impl FromStr for FsOptions {
    type Err = io::Error;

    /// Parses a comma-separated option list, mount `-o` style. The empty
    /// string yields the defaults.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Self::default();
        for opt in s.split(',').filter(|o| !o.is_empty()) {
            match opt {
                "strict_permission" => options.strict_permission = true,
                "flush_on_mutation" => options.flush_on_mutation = true,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unrecognized option `{other}`"),
                    ));
                }
            }
        }
        Ok(options)
    }
}

/// What the bridge hands over when mounting: the container to open, where to
/// log, and the option switches.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Path of the container image.
    pub container: PathBuf,
    /// Log destination; stderr when absent.
    pub log_file: Option<PathBuf>,
    pub options: FsOptions,
}

impl MountConfig {
    pub fn new(container: impl Into<PathBuf>) -> Self {
        Self {
            container: container.into(),
            log_file: None,
            options: FsOptions::default(),
        }
    }
}
