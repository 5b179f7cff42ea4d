use core::fmt;

/// POSIX-style error codes raised by the file system.
///
/// The set is closed: every failure surfaced by this crate maps to one of
/// these codes, each with a fixed human-readable description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    EACCES,
    EIO,
    ENOENT,
    EEXIST,
    ELOOP,
    ENOTDIR,
    EISDIR,
    EBADF,
    EINVAL,
    ENOTEMPTY,
    EPERM,
    EROFS,
}

impl Errno {
    pub fn message(self) -> &'static str {
        match self {
            Errno::EACCES => "access denied",
            Errno::EIO => "an I/O error occurred",
            Errno::ENOENT => "no such file or directory",
            Errno::EEXIST => "file already exists",
            Errno::ELOOP => "too many levels of symbolic links",
            Errno::ENOTDIR => "no such directory",
            Errno::EISDIR => "path is a directory",
            Errno::EBADF => "invalid file descriptor",
            Errno::EINVAL => "invalid value",
            Errno::ENOTEMPTY => "directory not empty",
            Errno::EPERM => "operation not permitted",
            Errno::EROFS => "file system is read-only",
        }
    }
}

/// An error raised by a file-system operation, carrying the syscall name
/// and the path(s) involved when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    pub errno: Errno,
    pub syscall: Option<&'static str>,
    pub path: Option<String>,
    pub dest: Option<String>,
}

impl FsError {
    pub fn new(errno: Errno) -> Self {
        FsError {
            errno,
            syscall: None,
            path: None,
            dest: None,
        }
    }

    pub fn syscall(errno: Errno, syscall: &'static str) -> Self {
        FsError {
            errno,
            syscall: Some(syscall),
            path: None,
            dest: None,
        }
    }

    pub fn op(errno: Errno, syscall: &'static str, path: impl Into<String>) -> Self {
        FsError {
            errno,
            syscall: Some(syscall),
            path: Some(path.into()),
            dest: None,
        }
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.errno, self.errno.message())?;
        if let Some(syscall) = self.syscall {
            write!(f, ", {}", syscall)?;
        }
        if let Some(path) = &self.path {
            write!(f, " '{}'", path)?;
        }
        if let Some(dest) = &self.dest {
            write!(f, " -> '{}'", dest)?;
        }
        Ok(())
    }
}

impl std::error::Error for FsError {}

pub type Result<T> = core::result::Result<T, FsError>;
