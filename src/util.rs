//! Small helpers shared by the builder and the service.

use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Returns the current timestamp since the Unix epoch, in seconds.
pub fn timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock panic!")
        .as_secs() as i64
}

/// Returns the real user ID of the calling process.
pub fn uid() -> u32 {
    unsafe { libc::getuid() }
}

/// Returns the real group ID of the calling process.
pub fn gid() -> u32 {
    unsafe { libc::getgid() }
}

/// Returns the final component of `path`, which is the name a packed file
/// gets inside the container.
pub fn basename(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
