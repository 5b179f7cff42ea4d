//! The virtual file system: path resolution, lazy materialization,
//! shadowing, and the top-level operation surface.

use crate::error::{Errno, FsError, Result};
use crate::flags::*;
use crate::host::FsResolver;
use crate::inode::*;
use crate::stat::Stats;
use crate::time::TimeSource;
use crate::vpath::{self, ValidationFlags};
use log::debug;
use spin::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Symlink expansions allowed in a single walk.
pub const MAX_SYMLINK_DEPTH: usize = 40;

/// An in-memory POSIX-like file system.
///
/// Paths are resolved against the current working directory, walked
/// through the root link map, and looked up one component at a time with
/// symlink chasing. A file system may shadow a frozen parent, in which
/// case unchanged entries are mirrored lazily and writes stay local.
pub struct MemFS {
    ignore_case: bool,
    readonly: AtomicBool,
    time: RwLock<TimeSource>,
    cwd: RwLock<String>,
    dir_stack: RwLock<Vec<String>>,
    /// Root entries, addressed by their absolute prefix (`"/"`).
    roots: RwLock<Option<LinkMap>>,
    /// The frozen parent this file system shadows, if any.
    shadow_root: Option<Arc<MemFS>>,
    /// Shadow inodes already created, keyed by the parent inode's number.
    shadows: RwLock<BTreeMap<usize, Arc<Inode>>>,
    pub(crate) files: RwLock<BTreeMap<usize, crate::file::OpenFile>>,
}

/// Construction options for [`MemFS::with_options`].
pub struct FsOptions {
    pub ignore_case: bool,
    pub time: TimeSource,
    /// Created with `mkdirp` and entered at construction.
    pub cwd: Option<String>,
    /// Initial tree, applied after `cwd`.
    pub files: Option<crate::set::FileSet>,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            ignore_case: false,
            time: TimeSource::Wall,
            cwd: None,
            files: None,
        }
    }
}

/// Outcome of a path walk. `node` is absent when only the final component
/// was missing; missing intermediate components are errors instead.
pub(crate) struct Walk {
    pub path: String,
    pub basename: String,
    pub parent: Option<Arc<Inode>>,
    pub node: Option<Arc<Inode>>,
}

/// Where a directory entry lives: the file system's root map or an
/// ordinary directory.
pub(crate) enum LinkLoc {
    Root,
    Dir(Arc<Inode>),
}

impl core::fmt::Debug for MemFS {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MemFS")
            .field("ignore_case", &self.ignore_case)
            .field("readonly", &self.is_readonly())
            .field("shadowed", &self.shadow_root.is_some())
            .finish()
    }
}

impl MemFS {
    pub fn new() -> Arc<MemFS> {
        Self::build(false, TimeSource::Wall, None)
    }

    pub fn with_options(options: FsOptions) -> Result<Arc<MemFS>> {
        let fs = Self::build(options.ignore_case, options.time, None);
        if let Some(cwd) = options.cwd {
            vpath::validate(&cwd, ValidationFlags::Absolute)?;
            let cwd = vpath::normalize(&cwd);
            fs.mkdirp(&cwd)?;
            fs.chdir(&cwd)?;
        }
        if let Some(files) = options.files {
            fs.apply(files)?;
        }
        Ok(fs)
    }

    fn build(ignore_case: bool, time: TimeSource, shadow_root: Option<Arc<MemFS>>) -> Arc<MemFS> {
        Arc::new(MemFS {
            ignore_case,
            readonly: AtomicBool::new(false),
            time: RwLock::new(time),
            cwd: RwLock::new(String::new()),
            dir_stack: RwLock::new(Vec::new()),
            roots: RwLock::new(None),
            shadow_root,
            shadows: RwLock::new(BTreeMap::new()),
            files: RwLock::new(BTreeMap::new()),
        })
    }

    /// Derive a mutable child that lazily mirrors this (frozen) file
    /// system. Case sensitivity is preserved; widening to case-sensitive
    /// is allowed, narrowing is not.
    pub fn shadow(self: &Arc<Self>) -> Result<Arc<MemFS>> {
        self.shadow_ignore_case(self.ignore_case)
    }

    pub fn shadow_ignore_case(self: &Arc<Self>, ignore_case: bool) -> Result<Arc<MemFS>> {
        if !self.is_readonly() {
            return Err(FsError::syscall(Errno::EPERM, "shadow"));
        }
        if ignore_case && !self.ignore_case {
            return Err(FsError::syscall(Errno::EINVAL, "shadow"));
        }
        debug!("shadow: deriving child file system");
        let child = Self::build(
            ignore_case,
            self.time.read().clone(),
            Some(self.clone()),
        );
        *child.cwd.write() = self.cwd.read().clone();
        Ok(child)
    }

    pub fn ignore_case(&self) -> bool {
        self.ignore_case
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::SeqCst)
    }

    /// Freeze the file system. Freezing is monotone: there is no way back.
    pub fn make_readonly(&self) {
        self.readonly.store(true, Ordering::SeqCst);
    }

    /// Current time in milliseconds, as seen by inode timestamps.
    pub fn time(&self) -> i64 {
        self.time.read().now()
    }

    pub fn set_time(&self, time: impl Into<TimeSource>) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::syscall(Errno::EPERM, "time"));
        }
        *self.time.write() = time.into();
        Ok(())
    }

    pub(crate) fn check_writable(&self, syscall: &'static str, path: &str) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::op(Errno::EROFS, syscall, path));
        }
        Ok(())
    }

    // === current-directory stack ===

    pub fn cwd(&self) -> Result<String> {
        let cwd = self.cwd.read().clone();
        if cwd.is_empty() {
            return Err(FsError::syscall(Errno::EINVAL, "cwd"));
        }
        Ok(cwd)
    }

    pub(crate) fn base_dir(&self) -> String {
        self.cwd.read().clone()
    }

    pub fn chdir(&self, path: &str) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::op(Errno::EPERM, "chdir", path));
        }
        let walk = self.walk(path, false, "chdir")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "chdir", path))?;
        if !node.is_dir() {
            return Err(FsError::op(Errno::ENOTDIR, "chdir", path));
        }
        *self.cwd.write() = walk.path;
        Ok(())
    }

    /// Push the current directory; with a path, also change into it.
    pub fn pushd(&self, path: Option<&str>) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::syscall(Errno::EPERM, "pushd"));
        }
        let current = self.cwd()?;
        if let Some(path) = path {
            self.chdir(path)?;
        }
        self.dir_stack.write().push(current);
        Ok(())
    }

    /// Pop and change back to the saved directory, if any.
    pub fn popd(&self) -> Result<Option<String>> {
        if self.is_readonly() {
            return Err(FsError::syscall(Errno::EPERM, "popd"));
        }
        let top = self.dir_stack.write().pop();
        if let Some(path) = &top {
            self.chdir(path)?;
        }
        Ok(top)
    }

    // === path resolution and walking ===

    pub(crate) fn resolve_path(&self, path: &str) -> Result<String> {
        vpath::validate(path, ValidationFlags::RelativeOrAbsolute)?;
        if vpath::is_absolute(path) {
            return Ok(vpath::normalize(path));
        }
        let cwd = self.cwd.read().clone();
        if cwd.is_empty() {
            return Err(FsError::op(Errno::EINVAL, "resolve", path));
        }
        Ok(vpath::resolve(&cwd, path))
    }

    pub(crate) fn walk(&self, path: &str, no_follow: bool, syscall: &'static str) -> Result<Walk> {
        let resolved = self.resolve_path(path)?;
        self.walk_resolved(&resolved, no_follow, syscall)
    }

    /// POSIX name resolution over an absolute, normalized path.
    pub(crate) fn walk_resolved(
        &self,
        resolved: &str,
        no_follow: bool,
        syscall: &'static str,
    ) -> Result<Walk> {
        let mut components = vpath::parse(resolved);
        let mut step = 0usize;
        let mut depth = 0usize;
        let mut parent: Option<Arc<Inode>> = None;
        loop {
            let last = step + 1 == components.len();
            let basename = components[step].clone();
            let node = match &parent {
                None => self.root_child(&basename),
                Some(dir) => self.dir_child(dir, &basename)?,
            };
            let node = match node {
                Some(node) => node,
                None => {
                    if last {
                        return Ok(Walk {
                            path: vpath::format(&components),
                            basename,
                            parent,
                            node: None,
                        });
                    }
                    let partial = vpath::format(&components[..=step]);
                    return Err(FsError::op(Errno::ENOENT, syscall, partial));
                }
            };
            if node.is_symlink() && !(no_follow && last) {
                depth += 1;
                if depth >= MAX_SYMLINK_DEPTH {
                    return Err(FsError::op(Errno::ELOOP, syscall, resolved));
                }
                let target = match &node.data.read().kind {
                    InodeKind::Symlink(target) => target.clone(),
                    _ => unreachable!(),
                };
                let dirname = vpath::format(&components[..step]);
                let target = vpath::resolve(&dirname, &target);
                let mut next = vpath::parse(&target);
                next.extend(components[step + 1..].iter().cloned());
                components = next;
                step = 0;
                parent = None;
                continue;
            }
            if last {
                // A root resolves with itself as parent.
                let parent = match parent {
                    Some(parent) => Some(parent),
                    None if node.is_dir() => Some(node.clone()),
                    None => None,
                };
                return Ok(Walk {
                    path: vpath::format(&components),
                    basename,
                    parent,
                    node: Some(node),
                });
            }
            if node.is_dir() {
                parent = Some(node);
                step += 1;
                continue;
            }
            let partial = vpath::format(&components[..=step]);
            return Err(FsError::op(Errno::ENOTDIR, syscall, partial));
        }
    }

    fn root_child(&self, name: &str) -> Option<Arc<Inode>> {
        self.ensure_root_links();
        self.roots.read().as_ref().and_then(|map| map.get(name).cloned())
    }

    fn dir_child(&self, dir: &Arc<Inode>, name: &str) -> Result<Option<Arc<Inode>>> {
        self.ensure_dir_links(dir)?;
        let data = dir.data.read();
        match &data.kind {
            InodeKind::Dir(DirState::Materialized(map)) => Ok(map.get(name).cloned()),
            _ => Ok(None),
        }
    }

    // === lazy materialization ===

    fn ensure_root_links(&self) {
        if self.roots.read().is_some() {
            return;
        }
        let mut map = LinkMap::new(self.ignore_case);
        if let Some(parent) = &self.shadow_root {
            parent.ensure_root_links();
            let entries: Vec<(String, Arc<Inode>)> = parent
                .roots
                .read()
                .as_ref()
                .map(|m| m.iter().map(|(n, c)| (n.clone(), c.clone())).collect())
                .unwrap_or_default();
            for (name, child) in entries {
                let shadow = self.get_shadow(&child);
                map.insert(&name, shadow);
            }
        }
        let mut guard = self.roots.write();
        if guard.is_none() {
            *guard = Some(map);
        }
    }

    /// Make sure a directory's link map is materialized, consulting the
    /// mount resolver or the shadowed parent as needed.
    pub(crate) fn ensure_dir_links(&self, dir: &Arc<Inode>) -> Result<()> {
        enum Pending {
            Done,
            Mount(ExternalSource),
            Shadow(Arc<Inode>),
        }
        {
            let data = dir.data.read();
            match &data.kind {
                InodeKind::Dir(DirState::Materialized(_)) => return Ok(()),
                InodeKind::Dir(_) => {}
                _ => return Err(FsError::syscall(Errno::ENOTDIR, "scandir")),
            }
        }
        let pending = {
            let mut data = dir.data.write();
            let shadow = data.shadow_root.clone();
            let shadowed = self.shadow_root.is_some();
            match &mut data.kind {
                InodeKind::Dir(state) => match state {
                    DirState::Materialized(_) => Pending::Done,
                    _ => {
                        // Clear the lazy state up front so re-entry finds
                        // an ordinary (if briefly empty) directory.
                        let taken = std::mem::replace(
                            state,
                            DirState::Materialized(LinkMap::new(self.ignore_case)),
                        );
                        match taken {
                            DirState::Pinned(ext) => Pending::Mount(ext),
                            DirState::Empty => match shadow {
                                Some(src) if shadowed => Pending::Shadow(src),
                                _ => Pending::Done,
                            },
                            DirState::Materialized(_) => unreachable!(),
                        }
                    }
                },
                _ => return Err(FsError::syscall(Errno::ENOTDIR, "scandir")),
            }
        };
        match pending {
            Pending::Done => Ok(()),
            Pending::Mount(ext) => self.materialize_mount(dir, ext),
            Pending::Shadow(src) => self.materialize_shadow_dir(dir, &src),
        }
    }

    fn materialize_mount(&self, dir: &Arc<Inode>, ext: ExternalSource) -> Result<()> {
        debug!("mount: materializing '{}'", ext.source);
        let now = self.time();
        let dev = dir.data.read().dev;
        let names = ext.resolver.readdir_sync(&ext.source)?;
        for name in names {
            let path = vpath::combine(&ext.source, &name);
            let meta = ext.resolver.stat_sync(&path)?;
            let child = if meta.is_directory() {
                Inode::new_dir(
                    dev,
                    meta.mode & 0o7777,
                    now,
                    DirState::Pinned(ExternalSource {
                        source: path,
                        resolver: ext.resolver.clone(),
                    }),
                )
            } else if meta.is_file() {
                Inode::new_file(
                    dev,
                    meta.mode & 0o7777,
                    now,
                    FileNode {
                        buffer: None,
                        size: Some(meta.size),
                        source: Some(ExternalSource {
                            source: path,
                            resolver: ext.resolver.clone(),
                        }),
                    },
                )
            } else {
                // symlinks and special files are not materialized
                continue;
            };
            let mut data = dir.data.write();
            if let InodeKind::Dir(DirState::Materialized(map)) = &mut data.kind {
                add_link(Some(dir), map, &name, &child);
            }
        }
        Ok(())
    }

    fn materialize_shadow_dir(&self, dir: &Arc<Inode>, src: &Arc<Inode>) -> Result<()> {
        let parent_fs = self.shadow_root.as_ref().unwrap();
        parent_fs.ensure_dir_links(src)?;
        let entries: Vec<(String, Arc<Inode>)> = {
            let data = src.data.read();
            match &data.kind {
                InodeKind::Dir(DirState::Materialized(map)) => {
                    map.iter().map(|(n, c)| (n.clone(), c.clone())).collect()
                }
                _ => Vec::new(),
            }
        };
        let mirrored: Vec<(String, Arc<Inode>)> = entries
            .into_iter()
            .map(|(name, child)| (name, self.get_shadow(&child)))
            .collect();
        let mut data = dir.data.write();
        if let InodeKind::Dir(DirState::Materialized(map)) = &mut data.kind {
            for (name, child) in mirrored {
                // counts were carried over by get_shadow
                map.insert(&name, child);
            }
        }
        Ok(())
    }

    // === shadow engine ===

    /// Mirror a parent-file-system inode into this one, memoized by inode
    /// number so repeated lookups observe the same object.
    pub(crate) fn get_shadow(&self, source: &Arc<Inode>) -> Arc<Inode> {
        if let Some(existing) = self.shadows.read().get(&source.ino) {
            return existing.clone();
        }
        let shadow = {
            let src = source.data.read();
            Arc::new(Inode {
                ino: source.ino,
                data: RwLock::new(InodeData {
                    dev: src.dev,
                    mode: src.mode,
                    atime_ms: src.atime_ms,
                    mtime_ms: src.mtime_ms,
                    ctime_ms: src.ctime_ms,
                    birthtime_ms: src.birthtime_ms,
                    nlink: src.nlink,
                    incoming: BTreeMap::new(),
                    shadow_root: Some(source.clone()),
                    paths: src.paths.clone(),
                    meta: src.meta.clone(),
                    kind: match &src.kind {
                        InodeKind::File(_) => InodeKind::File(FileNode::default()),
                        InodeKind::Dir(_) => InodeKind::Dir(DirState::Empty),
                        InodeKind::Symlink(target) => InodeKind::Symlink(target.clone()),
                    },
                }),
            })
        };
        // Register before translating the reverse links so parent/child
        // reference cycles resolve through the memo table.
        self.shadows.write().insert(source.ino, shadow.clone());
        let incoming: Vec<(usize, Weak<Inode>, Vec<String>)> = {
            let src = source.data.read();
            src.incoming
                .iter()
                .map(|(k, e)| (*k, e.parent.clone(), e.names.iter().cloned().collect()))
                .collect()
        };
        for (key, parent, names) in incoming {
            if key == ROOT_PARENT {
                shadow
                    .data
                    .write()
                    .incoming
                    .insert(ROOT_PARENT, IncomingEntry {
                        parent: Weak::new(),
                        names: names.into_iter().collect(),
                    });
            } else if let Some(parent) = parent.upgrade() {
                let shadow_parent = self.get_shadow(&parent);
                let entry = IncomingEntry {
                    parent: Arc::downgrade(&shadow_parent),
                    names: names.into_iter().collect(),
                };
                shadow.data.write().incoming.insert(shadow_parent.ino, entry);
            }
        }
        shadow
    }

    // === shared inode helpers ===

    pub(crate) fn with_links<R>(
        &self,
        loc: &LinkLoc,
        f: impl FnOnce(&mut LinkMap) -> R,
    ) -> Result<R> {
        match loc {
            LinkLoc::Root => {
                self.ensure_root_links();
                let mut guard = self.roots.write();
                Ok(f(guard.as_mut().unwrap()))
            }
            LinkLoc::Dir(dir) => {
                self.ensure_dir_links(dir)?;
                let mut data = dir.data.write();
                match &mut data.kind {
                    InodeKind::Dir(DirState::Materialized(map)) => Ok(f(map)),
                    _ => Err(FsError::syscall(Errno::ENOTDIR, "scandir")),
                }
            }
        }
    }

    pub(crate) fn touch(&self, node: &Arc<Inode>, mtime: bool, ctime: bool) {
        let now = self.time();
        let mut data = node.data.write();
        if mtime {
            data.mtime_ms = now;
        }
        if ctime {
            data.ctime_ms = now;
        }
    }

    /// Load a file's bytes, pulling from the external source or the
    /// shadowed parent on first access and caching the result.
    pub(crate) fn file_bytes(&self, node: &Arc<Inode>) -> Result<Vec<u8>> {
        {
            let data = node.data.read();
            match &data.kind {
                InodeKind::File(f) => {
                    if let Some(buffer) = &f.buffer {
                        return Ok(buffer.clone());
                    }
                }
                _ => return Err(FsError::syscall(Errno::EISDIR, "read")),
            }
        }
        let (ext, shadow) = {
            let mut data = node.data.write();
            match &mut data.kind {
                InodeKind::File(f) => {
                    if let Some(buffer) = &f.buffer {
                        return Ok(buffer.clone());
                    }
                    let ext = f.source.take();
                    if ext.is_some() {
                        f.size = None;
                    }
                    (ext, data.shadow_root.clone())
                }
                _ => return Err(FsError::syscall(Errno::EISDIR, "read")),
            }
        };
        let bytes = if let Some(ext) = ext {
            ext.resolver.read_file_sync(&ext.source)?
        } else if let Some(src) = shadow {
            self.file_bytes(&src)?
        } else {
            Vec::new()
        };
        let mut data = node.data.write();
        if let InodeKind::File(f) = &mut data.kind {
            if f.buffer.is_none() {
                f.buffer = Some(bytes.clone());
            }
        }
        Ok(bytes)
    }

    pub(crate) fn stats_for(&self, node: &Arc<Inode>) -> Stats {
        let size = inode_size(node);
        let data = node.data.read();
        Stats {
            dev: data.dev,
            ino: node.ino,
            mode: data.mode,
            nlink: data.nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            size,
            blksize: 4096,
            blocks: 0,
            atime_ms: data.atime_ms,
            mtime_ms: data.mtime_ms,
            ctime_ms: data.ctime_ms,
            birthtime_ms: data.birthtime_ms,
        }
    }

    /// All absolute paths that link to the inode, computed through the
    /// reverse links and cached until an ancestor link changes.
    pub(crate) fn paths_of(&self, node: &Arc<Inode>) -> Vec<String> {
        if let Some(paths) = &node.data.read().paths {
            return paths.clone();
        }
        let incoming: Vec<(usize, Weak<Inode>, Vec<String>)> = {
            let data = node.data.read();
            data.incoming
                .iter()
                .map(|(k, e)| (*k, e.parent.clone(), e.names.iter().cloned().collect()))
                .collect()
        };
        let mut out = Vec::new();
        for (key, parent, names) in incoming {
            if key == ROOT_PARENT {
                out.extend(names);
            } else if let Some(parent) = parent.upgrade() {
                for base in self.paths_of(&parent) {
                    for name in &names {
                        out.push(vpath::combine(&base, name));
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        node.data.write().paths = Some(out.clone());
        out
    }

    pub(crate) fn invalidate_paths(&self, node: &Arc<Inode>) {
        let children: Vec<Arc<Inode>> = {
            let mut data = node.data.write();
            data.paths = None;
            match &data.kind {
                InodeKind::Dir(DirState::Materialized(map)) => {
                    map.iter().map(|(_, c)| c.clone()).collect()
                }
                _ => Vec::new(),
            }
        };
        for child in children {
            self.invalidate_paths(&child);
        }
    }

    pub(crate) fn loc_for(&self, walk: &Walk) -> Result<LinkLoc> {
        if walk.basename == "/" {
            return Ok(LinkLoc::Root);
        }
        match &walk.parent {
            Some(parent) => Ok(LinkLoc::Dir(parent.clone())),
            None => Err(FsError::op(Errno::ENOENT, "open", walk.path.clone())),
        }
    }

    // === directory and link operations ===

    pub fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_mode(path, 0o777)
    }

    /// `mode` keeps its sticky bit but nothing above it.
    pub fn mkdir_mode(&self, path: &str, mode: u32) -> Result<()> {
        self.check_writable("mkdir", path)?;
        let mode = mode & 0o1777;
        let resolved = self.resolve_path(path)?;
        if vpath::dirname(&resolved) == resolved {
            // a new root carries a fresh device
            self.ensure_root_links();
            let now = self.time();
            let mut guard = self.roots.write();
            let map = guard.as_mut().unwrap();
            if map.contains(&resolved) {
                return Err(FsError::op(Errno::EEXIST, "mkdir", path));
            }
            let node = Inode::new_dir(
                next_dev(),
                mode,
                now,
                DirState::Materialized(LinkMap::new(self.ignore_case)),
            );
            add_link(None, map, &resolved, &node);
            return Ok(());
        }
        let walk = self.walk_resolved(&resolved, true, "mkdir")?;
        if walk.node.is_some() {
            return Err(FsError::op(Errno::EEXIST, "mkdir", path));
        }
        let parent = walk
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "mkdir", path))?;
        let now = self.time();
        let dev = parent.data.read().dev;
        let node = Inode::new_dir(
            dev,
            mode,
            now,
            DirState::Materialized(LinkMap::new(self.ignore_case)),
        );
        self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
            add_link(Some(&parent), map, &walk.basename, &node)
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    /// Create a directory and any missing ancestors. Idempotent.
    pub fn mkdirp(&self, path: &str) -> Result<()> {
        let resolved = self.resolve_path(path)?;
        match self.mkdir_mode(&resolved, 0o777) {
            Ok(()) => Ok(()),
            Err(e) if e.errno == Errno::EEXIST => Ok(()),
            Err(e) if e.errno == Errno::ENOENT => {
                let parent = vpath::dirname(&resolved);
                if parent == resolved {
                    return Err(e);
                }
                self.mkdirp(&parent)?;
                match self.mkdir_mode(&resolved, 0o777) {
                    Err(e) if e.errno == Errno::EEXIST => Ok(()),
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.check_writable("rmdir", path)?;
        let walk = self.walk(path, true, "rmdir")?;
        let node = walk
            .node
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "rmdir", path))?;
        if !node.is_dir() {
            return Err(FsError::op(Errno::ENOTDIR, "rmdir", path));
        }
        self.ensure_dir_links(&node)?;
        {
            let data = node.data.read();
            if let InodeKind::Dir(DirState::Materialized(map)) = &data.kind {
                if !map.is_empty() {
                    return Err(FsError::op(Errno::ENOTEMPTY, "rmdir", path));
                }
            }
        }
        let loc = self.loc_for(&walk)?;
        match &loc {
            LinkLoc::Root => {
                self.with_links(&loc, |map| remove_link(None, map, &walk.basename, &node))?;
            }
            LinkLoc::Dir(parent) => {
                let parent = parent.clone();
                self.with_links(&loc, |map| {
                    remove_link(Some(&parent), map, &walk.basename, &node)
                })?;
                self.touch(&parent, true, true);
            }
        }
        self.touch(&node, false, true);
        self.invalidate_paths(&node);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        self.check_writable("unlink", path)?;
        let walk = self.walk(path, true, "unlink")?;
        let node = walk
            .node
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "unlink", path))?;
        if node.is_dir() {
            return Err(FsError::op(Errno::EISDIR, "unlink", path));
        }
        let parent = walk
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "unlink", path))?;
        self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
            remove_link(Some(&parent), map, &walk.basename, &node)
        })?;
        self.touch(&parent, true, true);
        self.touch(&node, false, true);
        self.invalidate_paths(&node);
        Ok(())
    }

    /// Add a hard link. Directories cannot be multiply linked.
    pub fn link(&self, oldpath: &str, newpath: &str) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::op(Errno::EROFS, "link", oldpath).with_dest(newpath));
        }
        let old = self.walk(oldpath, false, "link")?;
        let node = old
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "link", oldpath).with_dest(newpath))?;
        if node.is_dir() {
            return Err(FsError::op(Errno::EPERM, "link", oldpath).with_dest(newpath));
        }
        let new = self.walk(newpath, true, "link")?;
        if new.node.is_some() {
            return Err(FsError::op(Errno::EEXIST, "link", oldpath).with_dest(newpath));
        }
        let parent = new
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "link", oldpath).with_dest(newpath))?;
        self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
            add_link(Some(&parent), map, &new.basename, &node)
        })?;
        self.touch(&parent, true, true);
        self.touch(&node, false, true);
        self.invalidate_paths(&node);
        Ok(())
    }

    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::op(Errno::EROFS, "rename", oldpath).with_dest(newpath));
        }
        let old = self.walk(oldpath, true, "rename")?;
        let node = old
            .node
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "rename", oldpath).with_dest(newpath))?;
        if old.basename == "/" {
            return Err(FsError::op(Errno::EINVAL, "rename", oldpath).with_dest(newpath));
        }
        let old_parent = old.parent.clone().unwrap();
        let new = self.walk(newpath, true, "rename")?;
        if new.basename == "/" {
            return Err(FsError::op(Errno::EINVAL, "rename", oldpath).with_dest(newpath));
        }
        let new_parent = new
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "rename", oldpath).with_dest(newpath))?;
        if node.is_dir() {
            // a directory cannot move under itself
            let prefix = vpath::add_trailing_separator(&old.path);
            if new.path.starts_with(&prefix) {
                return Err(FsError::op(Errno::EINVAL, "rename", oldpath).with_dest(newpath));
            }
        }
        if let Some(target) = &new.node {
            if target.ino == node.ino {
                return Ok(());
            }
            match (node.is_dir(), target.is_dir()) {
                (true, true) => {
                    self.ensure_dir_links(target)?;
                    let data = target.data.read();
                    if let InodeKind::Dir(DirState::Materialized(map)) = &data.kind {
                        if !map.is_empty() {
                            return Err(FsError::op(Errno::ENOTEMPTY, "rename", oldpath)
                                .with_dest(newpath));
                        }
                    }
                }
                (false, true) => {
                    return Err(FsError::op(Errno::EISDIR, "rename", oldpath).with_dest(newpath));
                }
                (true, false) => {
                    return Err(FsError::op(Errno::ENOTDIR, "rename", oldpath).with_dest(newpath));
                }
                (false, false) => {}
            }
            self.with_links(&LinkLoc::Dir(new_parent.clone()), |map| {
                remove_link(Some(&new_parent), map, &new.basename, target)
            })?;
            self.touch(target, false, true);
            self.invalidate_paths(target);
        }
        if old_parent.ino == new_parent.ino {
            self.with_links(&LinkLoc::Dir(old_parent.clone()), |map| {
                rename_link(&old_parent, map, &old.basename, &new.basename, &node)
            })?;
        } else {
            self.with_links(&LinkLoc::Dir(old_parent.clone()), |map| {
                remove_link(Some(&old_parent), map, &old.basename, &node)
            })?;
            self.with_links(&LinkLoc::Dir(new_parent.clone()), |map| {
                add_link(Some(&new_parent), map, &new.basename, &node)
            })?;
        }
        self.touch(&old_parent, true, true);
        self.touch(&new_parent, true, true);
        self.touch(&node, false, true);
        self.invalidate_paths(&node);
        Ok(())
    }

    /// Store `target` verbatim; it is interpreted at walk time relative to
    /// the directory holding the link.
    pub fn symlink(&self, target: &str, linkpath: &str) -> Result<()> {
        self.check_writable("symlink", linkpath)?;
        vpath::validate(target, ValidationFlags::RelativeOrAbsolute)?;
        let walk = self.walk(linkpath, true, "symlink")?;
        if walk.node.is_some() {
            return Err(FsError::op(Errno::EEXIST, "symlink", linkpath));
        }
        if walk.basename == "/" {
            return Err(FsError::op(Errno::EPERM, "symlink", linkpath));
        }
        let parent = walk
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "symlink", linkpath))?;
        let now = self.time();
        let dev = parent.data.read().dev;
        let node = Inode::new_symlink(dev, now, target.to_string());
        self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
            add_link(Some(&parent), map, &walk.basename, &node)
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let walk = self.walk(path, true, "readlink")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "readlink", path))?;
        let result = match &node.data.read().kind {
            InodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::op(Errno::EINVAL, "readlink", path)),
        };
        result
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<String>> {
        let walk = self.walk(path, false, "scandir")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "scandir", path))?;
        if !node.is_dir() {
            return Err(FsError::op(Errno::ENOTDIR, "scandir", path));
        }
        self.ensure_dir_links(&node)?;
        let data = node.data.read();
        match &data.kind {
            InodeKind::Dir(DirState::Materialized(map)) => Ok(map.names()),
            _ => Ok(Vec::new()),
        }
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        self.chmod_impl(path, mode, false)
    }

    pub fn lchmod(&self, path: &str, mode: u32) -> Result<()> {
        self.chmod_impl(path, mode, true)
    }

    fn chmod_impl(&self, path: &str, mode: u32, no_follow: bool) -> Result<()> {
        self.check_writable("chmod", path)?;
        let walk = self.walk(path, no_follow, "chmod")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "chmod", path))?;
        let now = self.time();
        let mut data = node.data.write();
        data.mode = (data.mode & S_IFMT) | (mode & !S_IFMT & 0o7777);
        data.ctime_ms = now;
        Ok(())
    }

    /// Graft an external tree at `target`; children materialize on first
    /// access through `resolver`.
    pub fn mount(&self, source: &str, target: &str, resolver: Arc<dyn FsResolver>) -> Result<()> {
        self.mount_mode(source, target, resolver, 0o777)
    }

    pub fn mount_mode(
        &self,
        source: &str,
        target: &str,
        resolver: Arc<dyn FsResolver>,
        mode: u32,
    ) -> Result<()> {
        if self.is_readonly() {
            return Err(FsError::op(Errno::EROFS, "mount", source).with_dest(target));
        }
        vpath::validate(source, ValidationFlags::Absolute)?;
        let mode = mode & 0o1777;
        let resolved = self.resolve_path(target)?;
        let ext = ExternalSource {
            source: source.to_string(),
            resolver,
        };
        let now = self.time();
        if vpath::dirname(&resolved) == resolved {
            self.ensure_root_links();
            let mut guard = self.roots.write();
            let map = guard.as_mut().unwrap();
            if map.contains(&resolved) {
                return Err(FsError::op(Errno::EEXIST, "mount", source).with_dest(target));
            }
            let node = Inode::new_dir(next_dev(), mode, now, DirState::Pinned(ext));
            add_link(None, map, &resolved, &node);
            return Ok(());
        }
        let walk = self.walk_resolved(&resolved, true, "mount")?;
        if walk.node.is_some() {
            return Err(FsError::op(Errno::EEXIST, "mount", source).with_dest(target));
        }
        let parent = walk
            .parent
            .clone()
            .ok_or_else(|| FsError::op(Errno::ENOENT, "mount", source).with_dest(target))?;
        let dev = parent.data.read().dev;
        let node = Inode::new_dir(dev, mode, now, DirState::Pinned(ext));
        self.with_links(&LinkLoc::Dir(parent.clone()), |map| {
            add_link(Some(&parent), map, &walk.basename, &node)
        })?;
        self.touch(&parent, true, true);
        Ok(())
    }

    /// Remove a path and everything below it. A missing path is fine.
    pub fn rimraf(&self, path: &str) -> Result<()> {
        let stats = match self.lstat(path) {
            Ok(stats) => stats,
            Err(e) if e.errno == Errno::ENOENT => return Ok(()),
            Err(e) => return Err(e),
        };
        if stats.is_directory() {
            let resolved = self.resolve_path(path)?;
            for name in self.readdir(&resolved)? {
                self.rimraf(&vpath::combine(&resolved, &name))?;
            }
            match self.rmdir(&resolved) {
                Err(e) if e.errno == Errno::ENOENT => Ok(()),
                other => other,
            }
        } else {
            match self.unlink(path) {
                Err(e) if e.errno == Errno::ENOENT => Ok(()),
                other => other,
            }
        }
    }

    // === stat family ===

    pub fn stat(&self, path: &str) -> Result<Stats> {
        let walk = self.walk(path, false, "stat")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "stat", path))?;
        Ok(self.stats_for(&node))
    }

    pub fn lstat(&self, path: &str) -> Result<Stats> {
        let walk = self.walk(path, true, "lstat")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "lstat", path))?;
        Ok(self.stats_for(&node))
    }

    pub fn exists(&self, path: &str) -> bool {
        matches!(self.walk(path, false, "stat"), Ok(walk) if walk.node.is_some())
    }

    /// The canonical path: absolute, normalized, symlinks resolved.
    pub fn realpath(&self, path: &str) -> Result<String> {
        let walk = self.walk(path, false, "realpath")?;
        walk.node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "realpath", path))?;
        Ok(walk.path)
    }

    /// Every hard-link path of the inode at `path`, sorted.
    pub fn paths(&self, path: &str) -> Result<Vec<String>> {
        let walk = self.walk(path, false, "stat")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "stat", path))?;
        Ok(self.paths_of(&node))
    }

    pub fn filemeta(&self, path: &str) -> Result<BTreeMap<String, String>> {
        let walk = self.walk(path, false, "stat")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "stat", path))?;
        let meta = node.data.read().meta.clone();
        Ok(meta)
    }

    pub(crate) fn set_filemeta(
        &self,
        path: &str,
        meta: BTreeMap<String, String>,
        no_follow: bool,
    ) -> Result<()> {
        if meta.is_empty() {
            return Ok(());
        }
        let walk = self.walk(path, no_follow, "stat")?;
        let node = walk
            .node
            .ok_or_else(|| FsError::op(Errno::ENOENT, "stat", path))?;
        node.data.write().meta.extend(meta);
        Ok(())
    }
}

/// Size as reported by `stat`: buffered length for loaded files, the
/// cached or shadowed size otherwise.
pub(crate) fn inode_size(node: &Arc<Inode>) -> usize {
    let data = node.data.read();
    match &data.kind {
        InodeKind::File(f) => {
            if let Some(buffer) = &f.buffer {
                buffer.len()
            } else if let Some(size) = f.size {
                size
            } else if let Some(src) = &data.shadow_root {
                inode_size(src)
            } else {
                0
            }
        }
        InodeKind::Symlink(target) => target.len(),
        InodeKind::Dir(_) => 0,
    }
}
