//! The open-file table and descriptor I/O.
//!
//! A descriptor buffers reads and writes privately: contents are loaded
//! from the inode on first access, and writes land in a descriptor-local
//! buffer that reaches the inode only on `fsync`/`close`. Descriptors
//! reference their inode by identity, so they survive `rename` and
//! `unlink` of the underlying path.

use crate::error::{Errno, FsError, Result};
use crate::flags::*;
use crate::fs::{inode_size, LinkLoc, MemFS};
use crate::inode::{add_link, next_fd, FileNode, Inode, InodeKind};
use crate::stat::Stats;
use std::io::SeekFrom;
use std::sync::Arc;

/// One entry in the open-file table.
pub(crate) struct OpenFile {
    pub fd: usize,
    pub path: String,
    pub basename: String,
    pub parent: Arc<Inode>,
    pub node: Arc<Inode>,
    pub flags: u32,
    /// Set once the descriptor holds content the inode has not seen.
    pub written: bool,
    pub offset: usize,
    /// Descriptor-local view of the file contents.
    pub buffer: Option<Vec<u8>>,
}

impl MemFS {
    pub fn open(&self, path: &str, flags: impl Into<OpenFlags>) -> Result<usize> {
        self.open_mode(path, flags, 0o666)
    }

    pub fn open_mode(&self, path: &str, flags: impl Into<OpenFlags>, mode: u32) -> Result<usize> {
        let flags = flags.into().resolve()?;
        let mutates = writable(flags) || flags & (O_CREAT | O_TRUNC) != 0;
        if mutates && self.is_readonly() {
            return Err(FsError::op(Errno::EROFS, "open", path));
        }
        let walk = self.walk(path, flags & O_NOFOLLOW != 0, "open")?;
        let node = match walk.node.clone() {
            Some(node) => {
                if flags & (O_CREAT | O_EXCL) == O_CREAT | O_EXCL {
                    return Err(FsError::op(Errno::EEXIST, "open", path));
                }
                if node.is_symlink() {
                    // only reachable under O_NOFOLLOW
                    return Err(FsError::op(Errno::ELOOP, "open", path));
                }
                if flags & O_DIRECTORY != 0 && node.is_file() {
                    return Err(FsError::op(Errno::ENOTDIR, "open", path));
                }
                if writable(flags) && node.is_dir() {
                    return Err(FsError::op(Errno::EISDIR, "open", path));
                }
                node
            }
            None => {
                if flags & O_CREAT == 0 || flags & O_DIRECTORY != 0 {
                    return Err(FsError::op(Errno::ENOENT, "open", path));
                }
                let parent = walk
                    .parent
                    .clone()
                    .ok_or_else(|| FsError::op(Errno::ENOENT, "open", path))?;
                let now = self.time();
                let dev = parent.data.read().dev;
                let node = Inode::new_file(
                    dev,
                    mode,
                    now,
                    FileNode {
                        buffer: Some(Vec::new()),
                        size: None,
                        source: None,
                    },
                );
                self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
                    add_link(Some(&parent), map, &walk.basename, &node)
                })?;
                self.touch(&parent, true, true);
                node
            }
        };
        let offset = if node.is_file() && flags & (O_APPEND | O_TRUNC) == O_APPEND {
            inode_size(&node)
        } else {
            0
        };
        let fd = next_fd();
        let mut entry = OpenFile {
            fd,
            path: walk.path,
            basename: walk.basename,
            parent: walk.parent.unwrap_or_else(|| node.clone()),
            node,
            flags,
            written: false,
            offset,
            buffer: None,
        };
        if flags & O_TRUNC != 0 {
            entry.buffer = Some(Vec::new());
            entry.written = true;
            if flags & O_SYNC != 0 {
                self.flush_entry(&mut entry, false)?;
            }
        }
        self.files.write().insert(fd, entry);
        Ok(fd)
    }

    /// Unregister the descriptor and flush its buffer and size back into
    /// the inode.
    pub fn close(&self, fd: usize) -> Result<()> {
        let mut entry = self
            .files
            .write()
            .remove(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "close"))?;
        self.flush_entry(&mut entry, true)
    }

    /// Read into `buf`. `position` reads at a fixed offset; `None` reads
    /// at, and advances, the descriptor offset.
    pub fn read(&self, fd: usize, buf: &mut [u8], position: Option<usize>) -> Result<usize> {
        let mut files = self.files.write();
        let entry = files
            .get_mut(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "read"))?;
        if !readable(entry.flags) {
            return Err(FsError::syscall(Errno::EBADF, "read"));
        }
        if entry.node.is_dir() {
            return Err(FsError::op(Errno::EISDIR, "read", entry.path.clone()));
        }
        if entry.buffer.is_none() {
            entry.buffer = Some(self.file_bytes(&entry.node)?);
        }
        let data = entry.buffer.as_ref().unwrap();
        let pos = position.unwrap_or(entry.offset);
        let count = if pos >= data.len() {
            0
        } else {
            (data.len() - pos).min(buf.len())
        };
        buf[..count].copy_from_slice(&data[pos..pos + count]);
        if position.is_none() {
            entry.offset = pos + count;
        }
        Ok(count)
    }

    /// Write `data`. The first write snapshots the inode's contents into
    /// the descriptor; the inode itself changes only on flush.
    pub fn write(&self, fd: usize, data: &[u8], position: Option<usize>) -> Result<usize> {
        if self.is_readonly() {
            return Err(FsError::syscall(Errno::EROFS, "write"));
        }
        let mut files = self.files.write();
        let entry = files
            .get_mut(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "write"))?;
        if !writable(entry.flags) {
            return Err(FsError::syscall(Errno::EBADF, "write"));
        }
        if entry.node.is_dir() {
            return Err(FsError::op(Errno::EISDIR, "write", entry.path.clone()));
        }
        if entry.buffer.is_none() {
            entry.buffer = Some(self.file_bytes(&entry.node)?);
        }
        let sync = entry.flags & O_SYNC != 0;
        let pos = position.unwrap_or(entry.offset);
        let end = pos
            .checked_add(data.len())
            .ok_or_else(|| FsError::op(Errno::EINVAL, "write", entry.path.clone()))?;
        entry.written = true;
        let buffer = entry.buffer.as_mut().unwrap();
        if end > buffer.len() {
            // grow to exactly the write target, zero-filling any gap
            buffer.resize(end, 0);
        }
        buffer[pos..end].copy_from_slice(data);
        if position.is_none() {
            entry.offset = end;
        }
        if sync {
            self.flush_entry_in_table(fd, &mut files, false)?;
        }
        Ok(data.len())
    }

    pub fn lseek(&self, fd: usize, pos: SeekFrom) -> Result<usize> {
        let mut files = self.files.write();
        let entry = files
            .get_mut(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "lseek"))?;
        let size = entry
            .buffer
            .as_ref()
            .map(|b| b.len())
            .unwrap_or_else(|| inode_size(&entry.node));
        let next = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => entry.offset as i64 + delta,
            SeekFrom::End(delta) => size as i64 + delta,
        };
        if next < 0 {
            return Err(FsError::syscall(Errno::EINVAL, "lseek"));
        }
        entry.offset = next as usize;
        Ok(entry.offset)
    }

    /// Flush data and metadata back into the inode.
    pub fn fsync(&self, fd: usize) -> Result<()> {
        self.sync_fd(fd, true)
    }

    /// Flush data only; the inode's cached size is left alone.
    pub fn fdatasync(&self, fd: usize) -> Result<()> {
        self.sync_fd(fd, false)
    }

    fn sync_fd(&self, fd: usize, metadata: bool) -> Result<()> {
        let mut files = self.files.write();
        self.flush_entry_in_table(fd, &mut files, metadata)
    }

    pub fn fstat(&self, fd: usize) -> Result<Stats> {
        let files = self.files.read();
        let entry = files
            .get(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "fstat"))?;
        Ok(self.stats_for(&entry.node))
    }

    fn flush_entry_in_table(
        &self,
        fd: usize,
        files: &mut std::collections::BTreeMap<usize, OpenFile>,
        metadata: bool,
    ) -> Result<()> {
        let entry = files
            .get_mut(&fd)
            .ok_or_else(|| FsError::syscall(Errno::EBADF, "fsync"))?;
        self.flush_entry(entry, metadata)
    }

    pub(crate) fn flush_entry(&self, entry: &mut OpenFile, metadata: bool) -> Result<()> {
        if !entry.written || entry.buffer.is_none() {
            return Ok(());
        }
        let bytes = entry.buffer.as_ref().unwrap().clone();
        let len = bytes.len();
        let now = self.time();
        let mut guard = entry.node.data.write();
        let data = &mut *guard;
        if let InodeKind::File(f) = &mut data.kind {
            f.buffer = Some(bytes);
            if metadata {
                f.size = Some(len);
            }
            data.mtime_ms = now;
            data.ctime_ms = now;
        }
        entry.written = false;
        Ok(())
    }

    // === whole-file convenience ===

    /// Read from the descriptor's current offset until the offset reaches
    /// a fixed point: two empty reads at the same offset end the loop.
    pub fn read_to_end(&self, fd: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut zero_at: Option<usize> = None;
        loop {
            let count = self.read(fd, &mut chunk, None)?;
            out.extend_from_slice(&chunk[..count]);
            if count == 0 {
                let offset = {
                    let files = self.files.read();
                    files
                        .get(&fd)
                        .ok_or_else(|| FsError::syscall(Errno::EBADF, "read"))?
                        .offset
                };
                if zero_at == Some(offset) {
                    break;
                }
                zero_at = Some(offset);
            } else {
                zero_at = None;
            }
        }
        Ok(out)
    }

    pub fn write_all(&self, fd: usize, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let count = self.write(fd, &data[written..], None)?;
            if count == 0 {
                break;
            }
            written += count;
        }
        Ok(())
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let fd = self.open(path, "r")?;
        let result = self.read_to_end(fd);
        let closed = self.close(fd);
        let bytes = result?;
        closed?;
        Ok(bytes)
    }

    pub fn read_file_string(&self, path: &str) -> Result<String> {
        String::from_utf8(self.read_file(path)?).map_err(|_| FsError::op(Errno::EINVAL, "read", path))
    }

    pub fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> Result<()> {
        self.write_file_with(path, data, "w")
    }

    pub fn write_file_with(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        flags: impl Into<OpenFlags>,
    ) -> Result<()> {
        let fd = self.open(path, flags)?;
        let result = self.write_all(fd, data.as_ref());
        let closed = self.close(fd);
        result?;
        closed
    }
}
