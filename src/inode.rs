//! Inodes, directory link maps, and hard-link bookkeeping.

use crate::flags::*;
use crate::host::FsResolver;
use spin::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

static DEV_COUNT: AtomicUsize = AtomicUsize::new(0);
static INO_COUNT: AtomicUsize = AtomicUsize::new(0);
static FD_COUNT: AtomicUsize = AtomicUsize::new(0);

/// Allocate a device ID. Never reused within the process.
pub(crate) fn next_dev() -> usize {
    DEV_COUNT.fetch_add(1, Ordering::SeqCst) + 1
}

pub(crate) fn next_ino() -> usize {
    INO_COUNT.fetch_add(1, Ordering::SeqCst) + 1
}

pub(crate) fn next_fd() -> usize {
    FD_COUNT.fetch_add(1, Ordering::SeqCst) + 1
}

/// Key used in `incoming` for links held by a file system's root map
/// rather than by a parent directory. Inode numbers start at 1, so 0 is
/// free to stand for "no parent inode".
pub(crate) const ROOT_PARENT: usize = 0;

pub(crate) const DEFAULT_UMASK: u32 = 0o022;

/// An identity-bearing file-system object, independent of any name.
///
/// The inode number lives outside the lock: it is immutable and serves as
/// the key for shadow memoization and incoming-link maps.
pub(crate) struct Inode {
    pub ino: usize,
    pub data: RwLock<InodeData>,
}

pub(crate) struct InodeData {
    pub dev: usize,
    pub mode: u32,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
    pub birthtime_ms: i64,
    pub nlink: usize,
    /// Every directory link that points at this inode, keyed by the
    /// parent's inode number ([`ROOT_PARENT`] for root-map entries).
    pub incoming: BTreeMap<usize, IncomingEntry>,
    /// Corresponding inode in the shadowed parent file system, if any.
    pub shadow_root: Option<Arc<Inode>>,
    /// Cached absolute paths; invalidated when any ancestor link changes.
    pub paths: Option<Vec<String>>,
    pub meta: BTreeMap<String, String>,
    pub kind: InodeKind,
}

pub(crate) struct IncomingEntry {
    pub parent: Weak<Inode>,
    pub names: BTreeSet<String>,
}

pub(crate) enum InodeKind {
    File(FileNode),
    Dir(DirState),
    Symlink(String),
}

#[derive(Default)]
pub(crate) struct FileNode {
    /// In-memory contents once loaded or written.
    pub buffer: Option<Vec<u8>>,
    /// Size cache for files whose contents have not been loaded yet.
    pub size: Option<usize>,
    /// External backing for lazily loaded mount files.
    pub source: Option<ExternalSource>,
}

#[derive(Clone)]
pub(crate) struct ExternalSource {
    pub source: String,
    pub resolver: Arc<dyn FsResolver>,
}

/// A directory's children. `Empty` defers to the shadowed parent,
/// `Pinned` to an external resolver; first access transitions both to
/// `Materialized`.
pub(crate) enum DirState {
    Empty,
    Pinned(ExternalSource),
    Materialized(LinkMap),
}

impl Inode {
    /// `mknod`: a fresh inode with type bits from `type_`, permission bits
    /// from `mode` masked by `umask`, and zero links.
    pub fn mknod(dev: usize, type_: u32, mode: u32, umask: u32, now: i64, kind: InodeKind) -> Arc<Inode> {
        Arc::new(Inode {
            ino: next_ino(),
            data: RwLock::new(InodeData {
                dev,
                mode: (mode & !S_IFMT & !umask & 0o7777) | (type_ & S_IFMT),
                atime_ms: now,
                mtime_ms: now,
                ctime_ms: now,
                birthtime_ms: now,
                nlink: 0,
                incoming: BTreeMap::new(),
                shadow_root: None,
                paths: None,
                meta: BTreeMap::new(),
                kind,
            }),
        })
    }

    pub fn new_file(dev: usize, mode: u32, now: i64, file: FileNode) -> Arc<Inode> {
        Inode::mknod(dev, S_IFREG, mode, DEFAULT_UMASK, now, InodeKind::File(file))
    }

    pub fn new_dir(dev: usize, mode: u32, now: i64, state: DirState) -> Arc<Inode> {
        Inode::mknod(dev, S_IFDIR, mode, DEFAULT_UMASK, now, InodeKind::Dir(state))
    }

    pub fn new_symlink(dev: usize, now: i64, target: String) -> Arc<Inode> {
        // symlink modes are fixed at 0o666; the umask does not apply
        Inode::mknod(dev, S_IFLNK, 0o666, 0, now, InodeKind::Symlink(target))
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.data.read().kind, InodeKind::Dir(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.data.read().kind, InodeKind::File(_))
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.data.read().kind, InodeKind::Symlink(_))
    }
}

/// An ordered name → inode map. Entries are kept sorted by the file
/// system's comparator; a case-insensitive map folds names for ordering
/// and lookup but preserves the spelling used at insertion.
pub(crate) struct LinkMap {
    ignore_case: bool,
    entries: BTreeMap<String, LinkEntry>,
}

struct LinkEntry {
    name: String,
    node: Arc<Inode>,
}

impl LinkMap {
    pub fn new(ignore_case: bool) -> Self {
        LinkMap {
            ignore_case,
            entries: BTreeMap::new(),
        }
    }

    fn fold(&self, name: &str) -> String {
        if self.ignore_case {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Inode>> {
        self.entries.get(&self.fold(name)).map(|e| &e.node)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&self.fold(name))
    }

    /// Insert without any link bookkeeping. Used directly when mirroring a
    /// shadowed parent, whose counts were already copied.
    pub fn insert(&mut self, name: &str, node: Arc<Inode>) {
        self.entries.insert(
            self.fold(name),
            LinkEntry {
                name: name.to_string(),
                node,
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<Inode>> {
        self.entries.remove(&self.fold(name)).map(|e| e.node)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.values().map(|e| e.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Inode>)> {
        self.entries.values().map(|e| (&e.name, &e.node))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Insert `name → node` into `links` and record the reverse link.
///
/// Callers hold the parent's write guard to reach `links`; only the child
/// inode is locked here.
pub(crate) fn add_link(parent: Option<&Arc<Inode>>, links: &mut LinkMap, name: &str, node: &Arc<Inode>) {
    links.insert(name, node.clone());
    let mut data = node.data.write();
    data.nlink += 1;
    let key = parent.map(|p| p.ino).unwrap_or(ROOT_PARENT);
    let entry = data.incoming.entry(key).or_insert_with(|| IncomingEntry {
        parent: parent.map(Arc::downgrade).unwrap_or_default(),
        names: BTreeSet::new(),
    });
    entry.names.insert(name.to_string());
}

/// Remove `name → node` from `links`; the reverse-link set for the parent
/// is dropped entirely once its last name goes away.
pub(crate) fn remove_link(parent: Option<&Arc<Inode>>, links: &mut LinkMap, name: &str, node: &Arc<Inode>) {
    links.remove(name);
    let mut data = node.data.write();
    data.nlink = data.nlink.saturating_sub(1);
    let key = parent.map(|p| p.ino).unwrap_or(ROOT_PARENT);
    if let Some(entry) = data.incoming.get_mut(&key) {
        entry.names.remove(name);
        if entry.names.is_empty() {
            data.incoming.remove(&key);
        }
    }
}

/// Rename within a single directory, leaving `nlink` untouched.
pub(crate) fn rename_link(parent: &Arc<Inode>, links: &mut LinkMap, old_name: &str, new_name: &str, node: &Arc<Inode>) {
    links.remove(old_name);
    links.insert(new_name, node.clone());
    let mut data = node.data.write();
    if let Some(entry) = data.incoming.get_mut(&parent.ino) {
        entry.names.remove(old_name);
        entry.names.insert(new_name.to_string());
    }
}
