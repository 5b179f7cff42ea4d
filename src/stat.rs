use crate::flags::*;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A snapshot of an inode's identity and metadata.
///
/// Ref: [http://pubs.opengroup.org/onlinepubs/009604499/basedefs/sys/stat.h.html]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Device ID of the root the inode belongs to
    pub dev: usize,
    /// Inode number
    pub ino: usize,
    /// Type bits in the top 4 bits, permission bits in the low 12
    pub mode: u32,
    /// Number of hard links
    pub nlink: usize,
    pub uid: u32,
    pub gid: u32,
    pub rdev: usize,
    /// File size in bytes; symlink target length for symlinks
    pub size: usize,
    pub blksize: usize,
    pub blocks: usize,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
}

impl Stats {
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symbolic_link(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_block_device(&self) -> bool {
        self.mode & S_IFMT == S_IFBLK
    }

    pub fn is_character_device(&self) -> bool {
        self.mode & S_IFMT == S_IFCHR
    }

    pub fn is_fifo(&self) -> bool {
        self.mode & S_IFMT == S_IFIFO
    }

    pub fn is_socket(&self) -> bool {
        self.mode & S_IFMT == S_IFSOCK
    }

    pub fn atime(&self) -> SystemTime {
        ms_to_system_time(self.atime_ms)
    }

    pub fn mtime(&self) -> SystemTime {
        ms_to_system_time(self.mtime_ms)
    }

    pub fn ctime(&self) -> SystemTime {
        ms_to_system_time(self.ctime_ms)
    }

    pub fn birthtime(&self) -> SystemTime {
        ms_to_system_time(self.birthtime_ms)
    }
}

fn ms_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
