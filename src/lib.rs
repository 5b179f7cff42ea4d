//! An in-memory POSIX-like virtual file system for tests.
//!
//! The file system is deterministic and single-threaded: inodes with
//! hard-link accounting, symlink resolution with a loop budget, lazily
//! materialized mounts over an external resolver, and copy-on-write
//! shadowing of a frozen parent file system.
//!
//! ```
//! use memfs::MemFS;
//!
//! let fs = MemFS::new();
//! fs.mkdirp("/tmp/app").unwrap();
//! fs.write_file("/tmp/app/config", "answer=42").unwrap();
//! assert_eq!(fs.read_file_string("/tmp/app/config").unwrap(), "answer=42");
//! ```

mod error;
mod file;
mod fs;
mod inode;
mod scan;
mod set;
mod stat;
mod time;

pub mod flags;
pub mod host;
pub mod vpath;

pub use error::{Errno, FsError, Result};
pub use flags::OpenFlags;
pub use fs::{FsOptions, MemFS, MAX_SYMLINK_DEPTH};
pub use host::{FsResolver, HostResolver, ResolvedMeta};
pub use scan::{Axis, Traversal};
pub use set::{DirectoryData, Entry, FileData, FileSet, LinkData, MountData, SymlinkData};
pub use stat::Stats;
pub use time::TimeSource;

#[cfg(test)]
mod tests;
