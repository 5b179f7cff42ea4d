//! Tree enumeration along an axis.

use crate::error::Result;
use crate::fs::MemFS;
use crate::stat::Stats;
use crate::vpath;

/// Which part of the tree a scan covers, relative to the start path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Ancestors,
    AncestorsOrSelf,
    SelfOnly,
    DescendantsOrSelf,
    Descendants,
}

/// Predicates steering a scan: `accept` gates inclusion in the result,
/// `traverse` gates recursion into (or past) a candidate.
#[derive(Default)]
pub struct Traversal<'a> {
    pub accept: Option<&'a dyn Fn(&str, &Stats) -> bool>,
    pub traverse: Option<&'a dyn Fn(&str, &Stats) -> bool>,
}

impl<'a> Traversal<'a> {
    fn accepts(&self, path: &str, stats: &Stats) -> bool {
        self.accept.map_or(true, |f| f(path, stats))
    }

    fn traverses(&self, path: &str, stats: &Stats) -> bool {
        self.traverse.map_or(true, |f| f(path, stats))
    }
}

impl MemFS {
    /// Enumerate paths along `axis`, resolving the final component of each
    /// candidate through symlinks.
    pub fn scan(&self, path: &str, axis: Axis, traversal: &Traversal) -> Result<Vec<String>> {
        self.scan_impl(path, axis, traversal, false)
    }

    /// Like [`MemFS::scan`], but candidates are examined without following
    /// a final symlink.
    pub fn lscan(&self, path: &str, axis: Axis, traversal: &Traversal) -> Result<Vec<String>> {
        self.scan_impl(path, axis, traversal, true)
    }

    fn scan_impl(
        &self,
        path: &str,
        axis: Axis,
        traversal: &Traversal,
        no_follow: bool,
    ) -> Result<Vec<String>> {
        let resolved = self.resolve_path(path)?;
        let stats = self.scan_stat(&resolved, no_follow)?;
        let mut results = Vec::new();
        let include_self = matches!(
            axis,
            Axis::AncestorsOrSelf | Axis::SelfOnly | Axis::DescendantsOrSelf
        );
        if include_self && traversal.accepts(&resolved, &stats) {
            results.push(resolved.clone());
        }
        match axis {
            Axis::Ancestors | Axis::AncestorsOrSelf => {
                let mut current = resolved;
                loop {
                    let parent = vpath::dirname(&current);
                    if parent == current {
                        break;
                    }
                    current = parent;
                    let stats = match self.scan_stat(&current, no_follow) {
                        Ok(stats) => stats,
                        Err(_) => break,
                    };
                    if traversal.accepts(&current, &stats) {
                        results.push(current.clone());
                    }
                    if !traversal.traverses(&current, &stats) {
                        break;
                    }
                }
            }
            Axis::Descendants | Axis::DescendantsOrSelf => {
                if stats.is_directory() && traversal.traverses(&resolved, &stats) {
                    self.scan_children(&resolved, traversal, no_follow, &mut results);
                }
            }
            Axis::SelfOnly => {}
        }
        Ok(results)
    }

    fn scan_children(
        &self,
        dir: &str,
        traversal: &Traversal,
        no_follow: bool,
        results: &mut Vec<String>,
    ) {
        // an unreadable branch must not abort the scan
        let names = match self.readdir(dir) {
            Ok(names) => names,
            Err(_) => return,
        };
        for name in names {
            let child = vpath::combine(dir, &name);
            let stats = match self.scan_stat(&child, no_follow) {
                Ok(stats) => stats,
                Err(_) => continue,
            };
            if traversal.accepts(&child, &stats) {
                results.push(child.clone());
            }
            if stats.is_directory() && traversal.traverses(&child, &stats) {
                self.scan_children(&child, traversal, no_follow, results);
            }
        }
    }

    fn scan_stat(&self, path: &str, no_follow: bool) -> Result<Stats> {
        if no_follow {
            self.lstat(path)
        } else {
            self.stat(path)
        }
    }
}
