//! Declarative file sets for bulk population.
//!
//! A [`FileSet`] maps names to entries: directories, files, symlinks,
//! hard links, mounts, and removals. Plain strings and byte vectors
//! convert into files, and a nested `FileSet` converts into a directory,
//! so trees read the way they are shaped.

use crate::error::{Errno, FsError, Result};
use crate::fs::MemFS;
use crate::host::FsResolver;
use crate::vpath::{self, ValidationFlags};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct FileData {
    pub data: Vec<u8>,
    pub mode: Option<u32>,
    pub meta: BTreeMap<String, String>,
}

pub struct DirectoryData {
    pub files: FileSet,
    pub mode: Option<u32>,
    pub meta: BTreeMap<String, String>,
}

pub struct SymlinkData {
    pub target: String,
    pub mode: Option<u32>,
    pub meta: BTreeMap<String, String>,
}

pub struct LinkData {
    /// Path of the existing entry to hard-link, relative to the set's
    /// directory unless absolute.
    pub path: String,
}

pub struct MountData {
    pub source: String,
    pub resolver: Arc<dyn FsResolver>,
    pub mode: Option<u32>,
    pub meta: BTreeMap<String, String>,
}

pub enum Entry {
    File(FileData),
    Directory(DirectoryData),
    Symlink(SymlinkData),
    Link(LinkData),
    Mount(MountData),
    /// Remove whatever is at the name (`rimraf`).
    Remove,
}

impl Entry {
    pub fn file(data: impl Into<Vec<u8>>) -> Entry {
        Entry::File(FileData {
            data: data.into(),
            mode: None,
            meta: BTreeMap::new(),
        })
    }

    pub fn directory(files: FileSet) -> Entry {
        Entry::Directory(DirectoryData {
            files,
            mode: None,
            meta: BTreeMap::new(),
        })
    }

    pub fn symlink(target: impl Into<String>) -> Entry {
        Entry::Symlink(SymlinkData {
            target: target.into(),
            mode: None,
            meta: BTreeMap::new(),
        })
    }

    pub fn link(path: impl Into<String>) -> Entry {
        Entry::Link(LinkData { path: path.into() })
    }

    pub fn mount(source: impl Into<String>, resolver: Arc<dyn FsResolver>) -> Entry {
        Entry::Mount(MountData {
            source: source.into(),
            resolver,
            mode: None,
            meta: BTreeMap::new(),
        })
    }
}

impl From<&str> for Entry {
    fn from(text: &str) -> Entry {
        Entry::file(text.as_bytes().to_vec())
    }
}

impl From<String> for Entry {
    fn from(text: String) -> Entry {
        Entry::file(text.into_bytes())
    }
}

impl From<&[u8]> for Entry {
    fn from(bytes: &[u8]) -> Entry {
        Entry::file(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Entry {
    fn from(bytes: Vec<u8>) -> Entry {
        Entry::file(bytes)
    }
}

impl From<FileSet> for Entry {
    fn from(files: FileSet) -> Entry {
        Entry::directory(files)
    }
}

/// An ordered collection of named entries.
#[derive(Default)]
pub struct FileSet {
    entries: Vec<(String, Entry)>,
}

impl FileSet {
    pub fn new() -> FileSet {
        FileSet::default()
    }

    pub fn add(mut self, name: impl Into<String>, entry: impl Into<Entry>) -> FileSet {
        self.entries.push((name.into(), entry.into()));
        self
    }

    pub fn remove(mut self, name: impl Into<String>) -> FileSet {
        self.entries.push((name.into(), Entry::Remove));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MemFS {
    /// Apply a file set against the current directory.
    ///
    /// Directories, files, and removals land first; symlinks, hard links,
    /// and mounts are deferred to a second pass so they may refer to
    /// entries created in the first. A root may only be a directory or a
    /// mount.
    pub fn apply(&self, files: FileSet) -> Result<()> {
        let base = self.base_dir();
        // deferral is global: a link anywhere may reference an entry
        // created anywhere else in the first pass
        let mut deferred: Vec<(String, Entry)> = Vec::new();
        self.apply_first_pass(files, &base, &mut deferred)?;
        for (path, entry) in deferred {
            self.apply_deferred(path, entry)?;
        }
        Ok(())
    }

    fn apply_first_pass(
        &self,
        files: FileSet,
        dirname: &str,
        deferred: &mut Vec<(String, Entry)>,
    ) -> Result<()> {
        for (name, entry) in files.entries {
            let path = vpath::resolve(dirname, &name);
            vpath::validate(&path, ValidationFlags::Absolute)?;
            let at_root = vpath::is_root(&path);
            match entry {
                Entry::Remove => {
                    if at_root {
                        return Err(FsError::op(Errno::EINVAL, "apply", path));
                    }
                    self.rimraf(&path)?;
                }
                Entry::File(file) => {
                    if at_root {
                        return Err(FsError::op(Errno::EINVAL, "apply", path));
                    }
                    self.mkdirp(&vpath::dirname(&path))?;
                    self.write_file(&path, &file.data)?;
                    if let Some(mode) = file.mode {
                        self.chmod(&path, mode)?;
                    }
                    self.set_filemeta(&path, file.meta, false)?;
                }
                Entry::Directory(dir) => {
                    self.mkdirp(&path)?;
                    if let Some(mode) = dir.mode {
                        self.chmod(&path, mode)?;
                    }
                    self.set_filemeta(&path, dir.meta, false)?;
                    self.apply_first_pass(dir.files, &path, deferred)?;
                }
                Entry::Link(link) => {
                    // resolve the source against this level's directory now
                    let source = vpath::resolve(dirname, &link.path);
                    deferred.push((path, Entry::Link(LinkData { path: source })));
                }
                entry => deferred.push((path, entry)),
            }
        }
        Ok(())
    }

    fn apply_deferred(&self, path: String, entry: Entry) -> Result<()> {
        let at_root = vpath::is_root(&path);
        match entry {
            Entry::Symlink(symlink) => {
                if at_root {
                    return Err(FsError::op(Errno::EINVAL, "apply", path));
                }
                self.mkdirp(&vpath::dirname(&path))?;
                self.symlink(&symlink.target, &path)?;
                if let Some(mode) = symlink.mode {
                    self.lchmod(&path, mode)?;
                }
                self.set_filemeta(&path, symlink.meta, true)?;
            }
            Entry::Link(link) => {
                if at_root {
                    return Err(FsError::op(Errno::EINVAL, "apply", path));
                }
                self.mkdirp(&vpath::dirname(&path))?;
                self.link(&link.path, &path)?;
            }
            Entry::Mount(mount) => {
                if !at_root {
                    self.mkdirp(&vpath::dirname(&path))?;
                }
                self.mount_mode(
                    &mount.source,
                    &path,
                    mount.resolver,
                    mount.mode.unwrap_or(0o777),
                )?;
                self.set_filemeta(&path, mount.meta, false)?;
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}
