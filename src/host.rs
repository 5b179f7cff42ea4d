//! The external file-system resolver used by mount points.

use crate::error::{Errno, FsError, Result};
use crate::flags::{S_IFDIR, S_IFREG};
use std::path::Path;

/// Metadata reported by a resolver for a single external entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMeta {
    pub mode: u32,
    pub size: usize,
}

impl ResolvedMeta {
    pub fn is_directory(&self) -> bool {
        self.mode & crate::flags::S_IFMT == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & crate::flags::S_IFMT == S_IFREG
    }
}

/// Synchronous access to a tree outside the virtual file system.
///
/// Mount points consult a resolver lazily: directory listings on first
/// access, file bytes on first read. Errors are surfaced to the caller
/// unchanged.
pub trait FsResolver: Send + Sync {
    fn stat_sync(&self, path: &str) -> Result<ResolvedMeta>;
    fn readdir_sync(&self, path: &str) -> Result<Vec<String>>;
    fn read_file_sync(&self, path: &str) -> Result<Vec<u8>>;
}

/// A resolver backed by the host file system through `std::fs`.
pub struct HostResolver;

impl FsResolver for HostResolver {
    fn stat_sync(&self, path: &str) -> Result<ResolvedMeta> {
        let meta = std::fs::metadata(Path::new(path)).map_err(|e| io_error(e, path))?;
        let mode = if meta.is_dir() {
            S_IFDIR | 0o777
        } else {
            S_IFREG | 0o666
        };
        Ok(ResolvedMeta {
            mode,
            size: meta.len() as usize,
        })
    }

    fn readdir_sync(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(Path::new(path)).map_err(|e| io_error(e, path))? {
            let entry = entry.map_err(|e| io_error(e, path))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(_) => return Err(FsError::op(Errno::EINVAL, "readdir", path)),
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_file_sync(&self, path: &str) -> Result<Vec<u8>> {
        std::fs::read(Path::new(path)).map_err(|e| io_error(e, path))
    }
}

fn io_error(e: std::io::Error, path: &str) -> FsError {
    use std::io::ErrorKind;
    let errno = match e.kind() {
        ErrorKind::NotFound => Errno::ENOENT,
        ErrorKind::PermissionDenied => Errno::EACCES,
        ErrorKind::AlreadyExists => Errno::EEXIST,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => Errno::EINVAL,
        _ => Errno::EIO,
    };
    FsError::op(errno, "resolver", path)
}
