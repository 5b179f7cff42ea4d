use crate::flags::*;
use crate::*;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A file system with a deterministic clock and `/` created and entered.
fn new_fs() -> Arc<MemFS> {
    MemFS::with_options(FsOptions {
        time: TimeSource::Fixed(1000),
        cwd: Some("/".to_string()),
        ..Default::default()
    })
    .expect("failed to build file system")
}

fn errno_of<T: std::fmt::Debug>(result: Result<T>) -> Errno {
    result.expect_err("expected an error").errno
}

// === round trips ===

#[test]
fn write_then_read_round_trip() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/data")?;
    fs.write_file("/data/blob", &[0u8, 1, 2, 255][..])?;
    assert_eq!(fs.read_file("/data/blob")?, vec![0u8, 1, 2, 255]);
    fs.write_file("/data/text", "hello")?;
    assert_eq!(fs.read_file_string("/data/text")?, "hello");
    Ok(())
}

#[test]
fn symlink_round_trip() -> Result<()> {
    let fs = new_fs();
    fs.symlink("../up/and/over", "/l")?;
    assert_eq!(fs.readlink("/l")?, "../up/and/over");
    assert!(fs.lstat("/l")?.is_symbolic_link());
    Ok(())
}

#[test]
fn rename_there_and_back() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.write_file("/a/f", "payload")?;
    fs.rename("/a/f", "/a/g")?;
    fs.rename("/a/g", "/a/f")?;
    assert_eq!(fs.readdir("/a")?, vec!["f"]);
    assert_eq!(fs.read_file_string("/a/f")?, "payload");
    Ok(())
}

#[test]
fn mkdirp_is_idempotent() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/deep/ly/nested")?;
    fs.mkdirp("/deep/ly/nested")?;
    fs.mkdirp("/deep/ly")?;
    assert!(fs.stat("/deep/ly/nested")?.is_directory());
    Ok(())
}

// === hard links ===

#[test]
fn hard_link_accounting() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/x", "z")?;
    fs.link("/x", "/y")?;
    assert_eq!(fs.stat("/x")?.nlink, 2);
    assert_eq!(fs.stat("/x")?.ino, fs.stat("/y")?.ino);
    fs.unlink("/x")?;
    assert_eq!(fs.stat("/y")?.nlink, 1);
    assert_eq!(fs.read_file_string("/y")?, "z");
    Ok(())
}

#[test]
fn hard_links_share_contents() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.mkdirp("/b")?;
    fs.write_file("/a/f", "one")?;
    fs.link("/a/f", "/b/g")?;
    fs.write_file("/a/f", "two")?;
    assert_eq!(fs.read_file_string("/b/g")?, "two");
    let paths = fs.paths("/a/f")?;
    assert_eq!(paths, vec!["/a/f", "/b/g"]);
    assert_eq!(fs.stat("/a/f")?.nlink, paths.len());
    Ok(())
}

#[test]
fn link_rejects_directories() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/d")?;
    assert_eq!(errno_of(fs.link("/d", "/e")), Errno::EPERM);
    Ok(())
}

// === rename semantics ===

#[test]
fn rename_across_directories() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.mkdirp("/b")?;
    fs.write_file("/a/f", "1")?;
    fs.set_time(TimeSource::Fixed(2000))?;
    fs.rename("/a/f", "/b/f")?;
    assert_eq!(fs.readdir("/a")?, Vec::<String>::new());
    assert_eq!(fs.read_file_string("/b/f")?, "1");
    assert_eq!(fs.stat("/a")?.mtime_ms, 2000);
    assert_eq!(fs.stat("/b")?.mtime_ms, 2000);
    Ok(())
}

#[test]
fn rename_onto_existing() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/dir")?;
    fs.mkdirp("/full")?;
    fs.write_file("/full/f", "x")?;
    fs.mkdirp("/empty")?;
    fs.write_file("/file", "y")?;

    // directory over non-empty directory
    assert_eq!(errno_of(fs.rename("/dir", "/full")), Errno::ENOTEMPTY);
    // directory over file
    assert_eq!(errno_of(fs.rename("/dir", "/file")), Errno::ENOTDIR);
    // file over directory
    assert_eq!(errno_of(fs.rename("/file", "/empty")), Errno::EISDIR);
    // directory over empty directory succeeds
    fs.rename("/dir", "/empty")?;
    assert!(fs.stat("/empty")?.is_directory());
    assert!(!fs.exists("/dir"));
    Ok(())
}

#[test]
fn rename_into_own_subtree_fails() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/d/sub")?;
    assert_eq!(errno_of(fs.rename("/d", "/d/sub/d")), Errno::EINVAL);
    Ok(())
}

#[test]
fn rename_replaces_file() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/old", "new content")?;
    fs.write_file("/target", "old content")?;
    fs.rename("/old", "/target")?;
    assert_eq!(fs.read_file_string("/target")?, "new content");
    assert!(!fs.exists("/old"));
    Ok(())
}

// === removal ===

#[test]
fn unlink_and_rmdir_type_checks() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/d")?;
    fs.write_file("/d/f", "x")?;
    assert_eq!(errno_of(fs.unlink("/d")), Errno::EISDIR);
    assert_eq!(errno_of(fs.rmdir("/d")), Errno::ENOTEMPTY);
    assert_eq!(errno_of(fs.rmdir("/d/f")), Errno::ENOTDIR);
    fs.unlink("/d/f")?;
    fs.rmdir("/d")?;
    assert!(!fs.exists("/d"));
    Ok(())
}

#[test]
fn rimraf_removes_trees_and_tolerates_absence() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/t/a/b")?;
    fs.write_file("/t/a/b/f", "x")?;
    fs.symlink("/t/a", "/t/l")?;
    fs.rimraf("/t")?;
    assert!(!fs.exists("/t"));
    fs.rimraf("/never/was")?;
    Ok(())
}

// === symlinks and the walker ===

#[test]
fn symlink_resolves_relative_to_containing_directory() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.write_file("/a/b", "inner")?;
    fs.symlink("b", "/a/l")?;
    assert_eq!(fs.read_file_string("/a/l")?, "inner");
    assert_eq!(fs.realpath("/a/l")?, "/a/b");
    Ok(())
}

#[test]
fn symlink_mode_is_not_masked() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    fs.symlink("/f", "/l")?;
    let stats = fs.lstat("/l")?;
    assert!(stats.is_symbolic_link());
    assert_eq!(stats.mode & 0o777, 0o666);
    Ok(())
}

#[test]
fn symlink_loop_detected() -> Result<()> {
    let fs = new_fs();
    fs.symlink("/l", "/l")?;
    assert_eq!(errno_of(fs.stat("/l")), Errno::ELOOP);
    assert!(fs.lstat("/l")?.is_symbolic_link());
    Ok(())
}

#[test]
fn symlink_budget_boundary() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/end", "ok")?;
    // /s1 -> /s2 -> ... -> /s39 -> /end: 39 expansions resolve
    for i in 1..=39u32 {
        let target = if i == 39 {
            "/end".to_string()
        } else {
            format!("/s{}", i + 1)
        };
        fs.symlink(&target, &format!("/s{}", i))?;
    }
    assert_eq!(fs.read_file_string("/s1")?, "ok");
    // one more hop crosses the budget
    fs.symlink("/s1", "/s0")?;
    assert_eq!(errno_of(fs.stat("/s0")), Errno::ELOOP);
    Ok(())
}

#[test]
fn walking_through_a_file_is_not_a_directory() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    let err = fs.stat("/f/child").expect_err("expected ENOTDIR");
    assert_eq!(err.errno, Errno::ENOTDIR);
    assert_eq!(err.path.as_deref(), Some("/f"));
    Ok(())
}

#[test]
fn root_resolves_with_itself_as_parent() -> Result<()> {
    let fs = new_fs();
    let walk = fs.walk("/", false, "stat")?;
    let node = walk.node.expect("root exists");
    let parent = walk.parent.expect("root walk captures a parent");
    assert_eq!(parent.ino, node.ino);
    assert_eq!(walk.path, "/");
    Ok(())
}

#[test]
fn stat_and_walk_agree_on_identity() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.write_file("/a/f", "x")?;
    let walk = fs.walk("/a/f", false, "stat")?;
    assert_eq!(fs.stat("/a/f")?.ino, walk.node.unwrap().ino);
    Ok(())
}

// === open and descriptor I/O ===

#[test]
fn open_exclusive_create_collides() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    assert_eq!(errno_of(fs.open("/f", "wx")), Errno::EEXIST);
    Ok(())
}

#[test]
fn open_flag_checks() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/d")?;
    fs.write_file("/f", "x")?;
    assert_eq!(errno_of(fs.open("/missing", "r")), Errno::ENOENT);
    assert_eq!(errno_of(fs.open("/f", "bogus")), Errno::EINVAL);
    assert_eq!(errno_of(fs.open("/d", "w")), Errno::EISDIR);
    assert_eq!(
        errno_of(fs.open("/f", O_RDONLY | O_DIRECTORY)),
        Errno::ENOTDIR
    );
    fs.symlink("/f", "/l")?;
    assert_eq!(errno_of(fs.open("/l", O_RDONLY | O_NOFOLLOW)), Errno::ELOOP);
    Ok(())
}

#[test]
fn descriptor_survives_unlink() -> Result<()> {
    let fs = new_fs();
    let fd = fs.open("/t", "w+")?;
    fs.write(fd, b"x", None)?;
    fs.unlink("/t")?;
    assert!(!fs.exists("/t"));
    let mut buf = [0u8; 4];
    let n = fs.read(fd, &mut buf, Some(0))?;
    assert_eq!(&buf[..n], b"x");
    fs.close(fd)?;
    Ok(())
}

#[test]
fn writes_reach_the_inode_only_on_flush() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "old")?;
    let fd = fs.open("/f", "r+")?;
    fs.write(fd, b"new", Some(0))?;
    // another reader still sees the inode's contents
    assert_eq!(fs.read_file_string("/f")?, "old");
    fs.fsync(fd)?;
    assert_eq!(fs.read_file_string("/f")?, "new");
    fs.close(fd)?;
    Ok(())
}

#[test]
fn append_and_truncate() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "one")?;
    fs.write_file_with("/f", ",two", "a")?;
    assert_eq!(fs.read_file_string("/f")?, "one,two");
    fs.write_file("/f", "")?;
    assert_eq!(fs.stat("/f")?.size, 0);
    Ok(())
}

#[test]
fn positioned_reads_leave_the_offset_alone() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "abcdef")?;
    let fd = fs.open("/f", "r")?;
    let mut buf = [0u8; 2];
    fs.read(fd, &mut buf, Some(4))?;
    assert_eq!(&buf, b"ef");
    fs.read(fd, &mut buf, None)?;
    assert_eq!(&buf, b"ab");
    fs.close(fd)?;
    Ok(())
}

#[test]
fn writes_past_the_end_zero_fill() -> Result<()> {
    let fs = new_fs();
    let fd = fs.open("/f", "w")?;
    fs.write(fd, b"tail", Some(4))?;
    fs.close(fd)?;
    assert_eq!(fs.read_file("/f")?, b"\0\0\0\0tail");
    Ok(())
}

#[test]
fn write_at_a_pathological_position_fails_cleanly() -> Result<()> {
    let fs = new_fs();
    let fd = fs.open("/f", "w+")?;
    fs.write(fd, b"abc", None)?;
    assert_eq!(errno_of(fs.write(fd, b"x", Some(usize::MAX))), Errno::EINVAL);
    // the descriptor is still usable after the rejected write
    let mut buf = [0u8; 3];
    fs.read(fd, &mut buf, Some(0))?;
    assert_eq!(&buf, b"abc");
    fs.close(fd)?;
    assert_eq!(fs.read_file_string("/f")?, "abc");
    Ok(())
}

#[test]
fn lseek_moves_the_offset() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "abcdef")?;
    let fd = fs.open("/f", "r")?;
    assert_eq!(fs.lseek(fd, SeekFrom::End(-2))?, 4);
    let mut buf = [0u8; 2];
    fs.read(fd, &mut buf, None)?;
    assert_eq!(&buf, b"ef");
    assert_eq!(fs.lseek(fd, SeekFrom::Start(1))?, 1);
    assert_eq!(fs.lseek(fd, SeekFrom::Current(2))?, 3);
    assert_eq!(errno_of(fs.lseek(fd, SeekFrom::Current(-5))), Errno::EINVAL);
    fs.close(fd)?;
    Ok(())
}

#[test]
fn descriptor_access_mode_enforced() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    let fd = fs.open("/f", "r")?;
    assert_eq!(errno_of(fs.write(fd, b"y", None)), Errno::EBADF);
    fs.close(fd)?;
    let fd = fs.open("/f", O_WRONLY)?;
    let mut buf = [0u8; 1];
    assert_eq!(errno_of(fs.read(fd, &mut buf, None)), Errno::EBADF);
    fs.close(fd)?;
    assert_eq!(errno_of(fs.close(fd)), Errno::EBADF);
    Ok(())
}

#[test]
fn fstat_matches_stat() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "abc")?;
    let fd = fs.open("/f", "r")?;
    assert_eq!(fs.fstat(fd)?, fs.stat("/f")?);
    fs.close(fd)?;
    assert_eq!(errno_of(fs.fstat(fd)), Errno::EBADF);
    Ok(())
}

// === stats and metadata ===

#[test]
fn size_tracks_contents() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "12345")?;
    assert_eq!(fs.stat("/f")?.size, 5);
    assert_eq!(fs.read_file("/f")?.len(), 5);
    Ok(())
}

#[test]
fn chmod_keeps_type_bits() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    fs.set_time(TimeSource::Fixed(2000))?;
    fs.chmod("/f", 0o600)?;
    let stats = fs.stat("/f")?;
    assert!(stats.is_file());
    assert_eq!(stats.mode & 0o7777, 0o600);
    assert_eq!(stats.ctime_ms, 2000);
    Ok(())
}

#[test]
fn fresh_roots_get_fresh_devices() -> Result<()> {
    let a = new_fs();
    let b = new_fs();
    assert_ne!(a.stat("/")?.dev, b.stat("/")?.dev);
    a.mkdirp("/sub")?;
    assert_eq!(a.stat("/sub")?.dev, a.stat("/")?.dev);
    Ok(())
}

#[test]
fn timestamps_come_from_the_clock() -> Result<()> {
    let ticks = Arc::new(AtomicUsize::new(0));
    let source = {
        let ticks = ticks.clone();
        move || 1000 + ticks.fetch_add(1, Ordering::SeqCst) as i64
    };
    let fs = MemFS::with_options(FsOptions {
        time: TimeSource::callback(source),
        cwd: Some("/".to_string()),
        ..Default::default()
    })?;
    fs.write_file("/f", "x")?;
    let first = fs.stat("/f")?.birthtime_ms;
    fs.write_file("/g", "y")?;
    assert!(fs.stat("/g")?.birthtime_ms > first);
    Ok(())
}

#[test]
fn readlink_requires_a_symlink() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    assert_eq!(errno_of(fs.readlink("/f")), Errno::EINVAL);
    assert_eq!(errno_of(fs.readlink("/missing")), Errno::ENOENT);
    Ok(())
}

#[test]
fn paths_cache_invalidated_by_reparenting() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a/b")?;
    fs.write_file("/a/b/f", "x")?;
    assert_eq!(fs.paths("/a/b/f")?, vec!["/a/b/f"]);
    fs.rename("/a", "/z")?;
    assert_eq!(fs.paths("/z/b/f")?, vec!["/z/b/f"]);
    assert_eq!(fs.paths("/z/b")?, vec!["/z/b"]);
    Ok(())
}

// === read-only and the directory stack ===

#[test]
fn freeze_is_monotone() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/f", "x")?;
    fs.make_readonly();
    assert!(fs.is_readonly());
    assert_eq!(errno_of(fs.mkdir("/d")), Errno::EROFS);
    assert_eq!(errno_of(fs.write_file("/f", "y")), Errno::EROFS);
    assert_eq!(errno_of(fs.unlink("/f")), Errno::EROFS);
    assert_eq!(errno_of(fs.rename("/f", "/g")), Errno::EROFS);
    assert_eq!(errno_of(fs.symlink("/f", "/l")), Errno::EROFS);
    assert_eq!(errno_of(fs.chmod("/f", 0o600)), Errno::EROFS);
    assert_eq!(errno_of(fs.open("/f", "w")), Errno::EROFS);
    assert_eq!(errno_of(fs.chdir("/")), Errno::EPERM);
    assert_eq!(errno_of(fs.pushd(None)), Errno::EPERM);
    assert_eq!(errno_of(fs.popd()), Errno::EPERM);
    assert_eq!(errno_of(fs.set_time(TimeSource::Fixed(0))), Errno::EPERM);
    // reads still work
    assert_eq!(fs.read_file_string("/f")?, "x");
    Ok(())
}

#[test]
fn directory_stack() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a/b")?;
    fs.chdir("/a")?;
    assert_eq!(fs.cwd()?, "/a");
    fs.pushd(Some("b"))?;
    assert_eq!(fs.cwd()?, "/a/b");
    fs.write_file("f", "relative")?;
    assert_eq!(fs.read_file_string("/a/b/f")?, "relative");
    assert_eq!(fs.popd()?, Some("/a".to_string()));
    assert_eq!(fs.cwd()?, "/a");
    assert_eq!(fs.popd()?, None);
    Ok(())
}

#[test]
fn relative_paths_need_a_cwd() {
    let fs = MemFS::new();
    assert_eq!(errno_of(fs.cwd()), Errno::EINVAL);
    assert_eq!(errno_of(fs.stat("relative")), Errno::EINVAL);
}

// === case sensitivity ===

#[test]
fn case_insensitive_lookup_preserves_spelling() -> Result<()> {
    let fs = MemFS::with_options(FsOptions {
        ignore_case: true,
        time: TimeSource::Fixed(1000),
        cwd: Some("/".to_string()),
        ..Default::default()
    })?;
    fs.write_file("/Readme.MD", "x")?;
    assert!(fs.exists("/readme.md"));
    assert_eq!(fs.readdir("/")?, vec!["Readme.MD"]);
    fs.write_file("/README.md", "y")?;
    assert_eq!(fs.readdir("/")?.len(), 1);
    assert_eq!(fs.read_file_string("/readme.md")?, "y");
    Ok(())
}

// === lazy mounts ===

struct CountingResolver {
    stats: AtomicUsize,
    readdirs: AtomicUsize,
    reads: AtomicUsize,
}

impl CountingResolver {
    fn new() -> Arc<Self> {
        Arc::new(CountingResolver {
            stats: AtomicUsize::new(0),
            readdirs: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        })
    }
}

impl FsResolver for CountingResolver {
    fn stat_sync(&self, path: &str) -> Result<ResolvedMeta> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        match path {
            "/src" | "/src/nested" => Ok(ResolvedMeta {
                mode: S_IFDIR | 0o777,
                size: 0,
            }),
            "/src/a.txt" | "/src/nested/b.txt" => Ok(ResolvedMeta {
                mode: S_IFREG | 0o666,
                size: 5,
            }),
            _ => Err(FsError::op(Errno::ENOENT, "stat", path)),
        }
    }

    fn readdir_sync(&self, path: &str) -> Result<Vec<String>> {
        self.readdirs.fetch_add(1, Ordering::SeqCst);
        match path {
            "/src" => Ok(vec!["a.txt".to_string(), "nested".to_string()]),
            "/src/nested" => Ok(vec!["b.txt".to_string()]),
            _ => Err(FsError::op(Errno::ENOENT, "scandir", path)),
        }
    }

    fn read_file_sync(&self, path: &str) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match path {
            "/src/a.txt" => Ok(b"hello".to_vec()),
            "/src/nested/b.txt" => Ok(b"world".to_vec()),
            _ => Err(FsError::op(Errno::ENOENT, "open", path)),
        }
    }
}

#[test]
fn mount_materializes_once() -> Result<()> {
    let fs = new_fs();
    let resolver = CountingResolver::new();
    fs.mount("/src", "/m", resolver.clone())?;
    // mounting alone consults nothing
    assert_eq!(resolver.readdirs.load(Ordering::SeqCst), 0);

    let stats = fs.stat("/m/a.txt")?;
    assert_eq!(stats.size, 5);
    assert_eq!(resolver.readdirs.load(Ordering::SeqCst), 1);
    // one stat per materialized entry
    assert_eq!(resolver.stats.load(Ordering::SeqCst), 2);

    // a second stat is served from the link map
    fs.stat("/m/a.txt")?;
    assert_eq!(resolver.readdirs.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.stats.load(Ordering::SeqCst), 2);

    // file bytes load once and stay cached
    assert_eq!(fs.read_file_string("/m/a.txt")?, "hello");
    assert_eq!(fs.read_file_string("/m/a.txt")?, "hello");
    assert_eq!(resolver.reads.load(Ordering::SeqCst), 1);

    // nested directories materialize on their own first access
    assert_eq!(fs.read_file_string("/m/nested/b.txt")?, "world");
    assert_eq!(resolver.readdirs.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn mounted_files_accept_writes() -> Result<()> {
    let fs = new_fs();
    let resolver = CountingResolver::new();
    fs.mount("/src", "/m", resolver)?;
    fs.write_file("/m/a.txt", "replaced")?;
    assert_eq!(fs.read_file_string("/m/a.txt")?, "replaced");
    fs.write_file("/m/fresh.txt", "new")?;
    assert_eq!(fs.readdir("/m")?, vec!["a.txt", "fresh.txt", "nested"]);
    Ok(())
}

#[test]
fn mount_host_directory() -> Result<()> {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello from host").unwrap();
    std::fs::write(dir.path().join("sub").join("inner.txt"), b"inner").unwrap();

    let fs = new_fs();
    fs.mount(dir.path().to_str().unwrap(), "/host", Arc::new(HostResolver))?;
    assert_eq!(fs.readdir("/host")?, vec!["hello.txt", "sub"]);
    assert_eq!(fs.read_file_string("/host/hello.txt")?, "hello from host");
    assert_eq!(fs.read_file_string("/host/sub/inner.txt")?, "inner");
    Ok(())
}

// === shadowing ===

#[test]
fn shadow_requires_a_frozen_parent() -> Result<()> {
    let fs = new_fs();
    assert_eq!(errno_of(fs.shadow()), Errno::EPERM);
    fs.make_readonly();
    fs.shadow()?;
    Ok(())
}

#[test]
fn shadow_case_sensitivity_rules() -> Result<()> {
    let sensitive = new_fs();
    sensitive.make_readonly();
    assert_eq!(errno_of(sensitive.shadow_ignore_case(true)), Errno::EINVAL);

    let insensitive = MemFS::with_options(FsOptions {
        ignore_case: true,
        time: TimeSource::Fixed(1000),
        cwd: Some("/".to_string()),
        ..Default::default()
    })?;
    insensitive.make_readonly();
    // preserving and widening are both fine
    assert!(insensitive.shadow()?.ignore_case());
    assert!(!insensitive.shadow_ignore_case(false)?.ignore_case());
    Ok(())
}

#[test]
fn shadow_copy_on_write() -> Result<()> {
    let parent = new_fs();
    parent.write_file("/a", "hello")?;
    parent.make_readonly();

    let child = parent.shadow()?;
    assert_eq!(child.read_file_string("/a")?, "hello");
    assert_eq!(child.stat("/a")?.ino, parent.stat("/a")?.ino);

    child.write_file("/a", "HI")?;
    assert_eq!(parent.read_file_string("/a")?, "hello");
    assert_eq!(child.read_file_string("/a")?, "HI");
    // identity is preserved across the copy-on-write
    assert_eq!(child.stat("/a")?.ino, parent.stat("/a")?.ino);
    assert_eq!(child.stat("/a")?.size, 2);
    assert_eq!(parent.stat("/a")?.size, 5);
    Ok(())
}

#[test]
fn unwritten_shadow_matches_parent_stats() -> Result<()> {
    let parent = new_fs();
    parent.mkdirp("/d/e")?;
    parent.write_file("/d/e/f", "contents")?;
    parent.symlink("e", "/d/l")?;
    parent.make_readonly();

    let child = parent.shadow()?;
    for path in &["/", "/d", "/d/e", "/d/e/f", "/d/l/f"] {
        let a = parent.stat(path)?;
        let b = child.stat(path)?;
        assert_eq!(a.dev, b.dev, "dev mismatch at {}", path);
        assert_eq!(a.ino, b.ino, "ino mismatch at {}", path);
        assert_eq!(a.size, b.size, "size mismatch at {}", path);
    }
    assert_eq!(child.readlink("/d/l")?, "e");
    Ok(())
}

#[test]
fn shadow_lookups_are_memoized() -> Result<()> {
    let parent = new_fs();
    parent.mkdirp("/d")?;
    parent.write_file("/d/f", "x")?;
    parent.make_readonly();

    let child = parent.shadow()?;
    let first = child.walk("/d/f", false, "stat")?.node.unwrap();
    let second = child.walk("/d/f", false, "stat")?.node.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    Ok(())
}

#[test]
fn shadow_mutations_stay_local() -> Result<()> {
    let parent = new_fs();
    parent.mkdirp("/d")?;
    parent.write_file("/d/keep", "k")?;
    parent.write_file("/d/gone", "g")?;
    parent.make_readonly();

    let child = parent.shadow()?;
    child.unlink("/d/gone")?;
    child.write_file("/d/new", "n")?;
    assert_eq!(child.readdir("/d")?, vec!["keep", "new"]);
    assert_eq!(parent.readdir("/d")?, vec!["gone", "keep"]);
    Ok(())
}

// === file sets ===

#[test]
fn apply_builds_trees_with_deferred_links() -> Result<()> {
    let fs = MemFS::with_options(FsOptions {
        time: TimeSource::Fixed(1000),
        cwd: Some("/".to_string()),
        files: Some(
            FileSet::new()
                .add(
                    "/app",
                    FileSet::new()
                        .add("readme.txt", "docs")
                        .add("data.bin", &[1u8, 2, 3][..])
                        // refers to a sibling from the same set
                        .add("alias", Entry::link("readme.txt"))
                        .add("current", Entry::symlink("readme.txt")),
                )
                .add("/scratch", FileSet::new()),
        ),
        ..Default::default()
    })?;
    assert_eq!(fs.read_file_string("/app/readme.txt")?, "docs");
    assert_eq!(fs.read_file("/app/data.bin")?, vec![1, 2, 3]);
    assert_eq!(fs.stat("/app/alias")?.nlink, 2);
    assert_eq!(fs.read_file_string("/app/current")?, "docs");
    assert_eq!(fs.readlink("/app/current")?, "readme.txt");
    assert!(fs.stat("/scratch")?.is_directory());
    Ok(())
}

#[test]
fn apply_removals_and_roots() -> Result<()> {
    let fs = new_fs();
    fs.write_file("/stale", "x")?;
    fs.apply(FileSet::new().remove("/stale"))?;
    assert!(!fs.exists("/stale"));
    // a root may not be a file
    assert_eq!(
        errno_of(fs.apply(FileSet::new().add("/", "nope"))),
        Errno::EINVAL
    );
    Ok(())
}

#[test]
fn apply_attaches_metadata() -> Result<()> {
    let fs = new_fs();
    let mut meta = BTreeMap::new();
    meta.insert("origin".to_string(), "fixture".to_string());
    fs.apply(FileSet::new().add(
        "/f",
        Entry::File(FileData {
            data: b"x".to_vec(),
            mode: Some(0o640),
            meta,
        }),
    ))?;
    assert_eq!(fs.stat("/f")?.mode & 0o7777, 0o640);
    assert_eq!(
        fs.filemeta("/f")?.get("origin").map(String::as_str),
        Some("fixture")
    );
    Ok(())
}

// === scan ===

#[test]
fn scan_descendants_with_pruning() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/src/util")?;
    fs.mkdirp("/target")?;
    fs.write_file("/src/lib.rs", "")?;
    fs.write_file("/src/main.rs", "")?;
    fs.write_file("/src/util/helpers.rs", "")?;
    fs.write_file("/target/out.bin", "")?;

    let accept = |path: &str, _: &Stats| path.ends_with(".rs");
    let traverse = |path: &str, _: &Stats| path != "/target";
    let traversal = Traversal {
        accept: Some(&accept),
        traverse: Some(&traverse),
    };
    assert_eq!(
        fs.scan("/", Axis::DescendantsOrSelf, &traversal)?,
        vec!["/src/lib.rs", "/src/main.rs", "/src/util/helpers.rs"]
    );
    Ok(())
}

#[test]
fn scan_ancestors() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/src/util")?;
    fs.write_file("/src/util/helpers.rs", "")?;
    assert_eq!(
        fs.scan(
            "/src/util/helpers.rs",
            Axis::Ancestors,
            &Traversal::default()
        )?,
        vec!["/src/util", "/src", "/"]
    );
    assert_eq!(
        fs.scan("/src/util", Axis::SelfOnly, &Traversal::default())?,
        vec!["/src/util"]
    );
    Ok(())
}

#[test]
fn lscan_sees_symlinks_themselves() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/d")?;
    fs.write_file("/d/f", "x")?;
    fs.symlink("/d/f", "/d/l")?;
    let accept = |_: &str, stats: &Stats| stats.is_symbolic_link();
    let traversal = Traversal {
        accept: Some(&accept),
        traverse: None,
    };
    assert_eq!(fs.lscan("/", Axis::Descendants, &traversal)?, vec!["/d/l"]);
    assert_eq!(
        fs.scan("/", Axis::Descendants, &traversal)?,
        Vec::<String>::new()
    );
    Ok(())
}

// === bookkeeping invariants ===

#[test]
fn nlink_matches_reverse_links() -> Result<()> {
    let fs = new_fs();
    fs.mkdirp("/a")?;
    fs.mkdirp("/b")?;
    fs.write_file("/a/f", "x")?;
    // -/
    //   +-a
    //   |  `-f <n>
    //   `-b
    fs.link("/a/f", "/b/g")?;
    fs.link("/a/f", "/b/h")?;
    // -/
    //   +-a
    //   |  `-f <n>
    //   `-b
    //      +-g <n>
    //      `-h <n>
    assert_eq!(fs.stat("/a/f")?.nlink, 3);
    assert_eq!(fs.paths("/a/f")?, vec!["/a/f", "/b/g", "/b/h"]);
    fs.unlink("/b/g")?;
    assert_eq!(fs.stat("/a/f")?.nlink, 2);
    assert_eq!(fs.paths("/a/f")?, vec!["/a/f", "/b/h"]);
    Ok(())
}

#[test]
fn error_strings_carry_context() {
    let fs = new_fs();
    let err = fs.stat("/nope").expect_err("missing file");
    assert_eq!(
        err.to_string(),
        "ENOENT: no such file or directory, stat '/nope'"
    );
}
