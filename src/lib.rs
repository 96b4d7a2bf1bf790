//! A user-space flat filesystem backed by a single fixed-size container image.
//!
//! The crate exposes two surfaces: [`builder`], which packs a set of host
//! files into a freshly formatted container, and [`fs::MyFs`], the mounted
//! filesystem service that satisfies the bridge callbacks declared by
//! [`ops::Filesystem`]. The namespace is a single flat root directory; there
//! are no subdirectories, links or renames.

pub mod block;
pub mod builder;
pub mod config;
pub mod error;
pub mod fs;
pub mod layout;
pub mod logger;
pub mod ops;
pub mod util;

pub use crate::config::{FsOptions, MountConfig};
pub use crate::error::FsError;
pub use crate::fs::MyFs;
pub use crate::ops::Filesystem;
