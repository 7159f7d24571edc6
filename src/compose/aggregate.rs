use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, Result};
use crate::fs::{
    FileAccess, FileAttributes, FileShare, FileSystem, FsItem, Items, OpenMode, Paths,
    SearchPattern, SearchTarget, VfsFile, same_filesystem,
};
use crate::path::VfsPath;
use crate::watcher::{AggregateWatcher, Watcher};

/// A readonly ordered overlay over a stack of filesystems.
///
/// Index 0 is the lowest priority and the last entry the highest; an
/// optional fallback sits below the whole stack. Later entries shadow
/// earlier ones for every lookup, and enumerations merge all layers with
/// shadowed duplicates removed. Writes are rejected with `ReadOnly`; only
/// `Open`-mode, non-write file access is allowed through.
///
/// A layer that is itself an aggregate answers lookups for everything below
/// it: resolution delegates to the nested aggregate and does not fall
/// through to lower layers of this stack, even when the nested aggregate
/// reports nothing. Deliberate, and load-bearing for stacked overlay
/// setups. See the crate documentation before changing it.
///
/// A filesystem cannot be added to itself; deeper reference cycles are not
/// detected and must not be built.
pub struct AggregateFileSystem {
    this: Weak<AggregateFileSystem>,
    fallback: Option<Arc<dyn FileSystem>>,
    layers: RwLock<Vec<Arc<dyn FileSystem>>>,
    watchers: Mutex<Vec<Weak<AggregateWatcher>>>,
}

pub(crate) struct Resolved {
    pub fs: Arc<dyn FileSystem>,
    pub is_file: bool,
}

impl AggregateFileSystem {
    pub fn new() -> Arc<AggregateFileSystem> {
        Self::with_fallback(None)
    }

    /// An aggregate whose misses fall through to `fallback`, below the
    /// whole stack.
    pub fn with_fallback(fallback: Option<Arc<dyn FileSystem>>) -> Arc<AggregateFileSystem> {
        Arc::new_cyclic(|this| AggregateFileSystem {
            this: this.clone(),
            fallback,
            layers: RwLock::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn as_dyn(&self) -> Arc<dyn FileSystem> {
        self.this.upgrade().expect("filesystem self reference")
    }

    pub fn fallback(&self) -> Option<&Arc<dyn FileSystem>> {
        self.fallback.as_ref()
    }

    /// The stack, lowest priority first.
    pub fn filesystems(&self) -> Vec<Arc<dyn FileSystem>> {
        self.layers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Push a filesystem on top of the stack (highest priority). Live
    /// watchers get a child watcher for it.
    pub fn add_filesystem(&self, fs: Arc<dyn FileSystem>) -> Result<()> {
        self.check_addable(&fs)?;
        {
            let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
            if layers.iter().any(|layer| same_filesystem(layer, &fs)) {
                return Err(FsError::invalid_argument(
                    "filesystem is already in the stack",
                ));
            }
            layers.push(fs.clone());
        }
        tracing::debug!("aggregate: added layer, rewiring watchers");
        for watcher in self.live_watchers() {
            attach_child(&watcher, &fs);
        }
        Ok(())
    }

    /// Remove a filesystem from the stack, detaching its child watcher
    /// from every live watcher.
    pub fn remove_filesystem(&self, fs: &Arc<dyn FileSystem>) -> Result<()> {
        {
            let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
            let Some(index) = layers.iter().position(|layer| same_filesystem(layer, fs)) else {
                return Err(FsError::invalid_argument("filesystem is not in the stack"));
            };
            layers.remove(index);
        }
        tracing::debug!("aggregate: removed layer, rewiring watchers");
        for watcher in self.live_watchers() {
            watcher.remove_from(fs);
        }
        Ok(())
    }

    /// Replace the whole stack. Live watchers are rewired to the new
    /// layers (plus the fallback).
    pub fn set_filesystems(&self, filesystems: Vec<Arc<dyn FileSystem>>) -> Result<()> {
        for (i, fs) in filesystems.iter().enumerate() {
            self.check_addable(fs)?;
            if filesystems[..i].iter().any(|seen| same_filesystem(seen, fs)) {
                return Err(FsError::invalid_argument(
                    "filesystem appears twice in the stack",
                ));
            }
        }
        *self.layers.write().unwrap_or_else(PoisonError::into_inner) = filesystems;
        for watcher in self.live_watchers() {
            watcher.clear();
            self.attach_children(&watcher);
        }
        Ok(())
    }

    /// Drop every layer. The fallback, if any, stays.
    pub fn clear_filesystems(&self) {
        self.layers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for watcher in self.live_watchers() {
            watcher.clear();
            self.attach_children(&watcher);
        }
    }

    fn check_addable(&self, fs: &Arc<dyn FileSystem>) -> Result<()> {
        if ptr::addr_eq(Arc::as_ptr(fs), self as *const AggregateFileSystem) {
            return Err(FsError::invalid_argument(
                "an aggregate cannot contain itself",
            ));
        }
        Ok(())
    }

    /// Candidate layers in lookup order: top of the stack first, the
    /// fallback last.
    fn candidates(&self) -> Vec<Arc<dyn FileSystem>> {
        let layers = self.layers.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<Arc<dyn FileSystem>> = layers.iter().rev().cloned().collect();
        drop(layers);
        if let Some(fallback) = &self.fallback {
            out.push(fallback.clone());
        }
        out
    }

    /// Attach order for watchers: fallback first, then the stack from the
    /// bottom up.
    fn attach_order(&self) -> Vec<Arc<dyn FileSystem>> {
        let mut out: Vec<Arc<dyn FileSystem>> = Vec::new();
        if let Some(fallback) = &self.fallback {
            out.push(fallback.clone());
        }
        out.extend(
            self.layers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        out
    }

    fn live_watchers(&self) -> Vec<Arc<AggregateWatcher>> {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|w| w.strong_count() > 0);
        watchers.iter().filter_map(Weak::upgrade).collect()
    }

    fn attach_children(&self, watcher: &Arc<AggregateWatcher>) {
        for fs in self.attach_order() {
            attach_child(watcher, &fs);
        }
    }

    /// Find the layer owning `path`, walking top-of-stack → bottom →
    /// fallback. A nested aggregate answers the whole lookup.
    pub(crate) fn resolve(&self, path: &VfsPath, target: SearchTarget) -> Result<Option<Resolved>> {
        for fs in self.candidates() {
            if let Some(nested) = fs.as_aggregate() {
                return nested.resolve(path, target);
            }
            let found = match target {
                SearchTarget::File => fs.file_exists(path)?.then_some(true),
                SearchTarget::Directory => fs.directory_exists(path)?.then_some(false),
                SearchTarget::Both => {
                    if fs.directory_exists(path)? {
                        Some(false)
                    } else if fs.file_exists(path)? {
                        Some(true)
                    } else {
                        None
                    }
                }
            };
            if let Some(is_file) = found {
                return Ok(Some(Resolved { fs, is_file }));
            }
        }
        Ok(None)
    }

    fn read_only<T>(&self, path: &VfsPath) -> Result<T> {
        Err(FsError::read_only(path))
    }
}

/// Attach a child watcher for `fs` to `watcher`, if the layer can watch the
/// watched path. Attachment failures are logged, not fatal: the rest of the
/// stack keeps reporting.
fn attach_child(watcher: &Arc<AggregateWatcher>, fs: &Arc<dyn FileSystem>) {
    let path = watcher.core().path().clone();
    if !fs.can_watch(&path) {
        return;
    }
    match fs.watch(&path) {
        Ok(child) => watcher.add(child),
        Err(e) => tracing::warn!("aggregate: failed to attach child watcher at {path}: {e}"),
    }
}

impl FileSystem for AggregateFileSystem {
    fn create_directory(&self, path: &VfsPath) -> Result<()> {
        self.read_only(path)
    }

    fn directory_exists(&self, path: &VfsPath) -> Result<bool> {
        Ok(self.resolve(path, SearchTarget::Directory)?.is_some())
    }

    fn move_directory(&self, src: &VfsPath, _dst: &VfsPath) -> Result<()> {
        self.read_only(src)
    }

    fn delete_directory(&self, path: &VfsPath, _recursive: bool) -> Result<()> {
        self.read_only(path)
    }

    fn file_exists(&self, path: &VfsPath) -> Result<bool> {
        Ok(self.resolve(path, SearchTarget::File)?.is_some())
    }

    fn file_length(&self, path: &VfsPath) -> Result<u64> {
        match self.resolve(path, SearchTarget::File)? {
            Some(found) => found.fs.file_length(path),
            None => Err(FsError::not_found(path)),
        }
    }

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<Box<dyn VfsFile>> {
        if mode != OpenMode::Open || access.contains(FileAccess::WRITE) {
            return self.read_only(path);
        }
        match self.resolve(path, SearchTarget::File)? {
            Some(found) => found.fs.open_file(path, mode, access, share),
            None => Err(FsError::not_found(path)),
        }
    }

    fn copy_file(&self, src: &VfsPath, _dst: &VfsPath, _overwrite: bool) -> Result<()> {
        self.read_only(src)
    }

    fn move_file(&self, src: &VfsPath, _dst: &VfsPath) -> Result<()> {
        self.read_only(src)
    }

    fn replace_file(
        &self,
        src: &VfsPath,
        _dst: &VfsPath,
        _backup: Option<&VfsPath>,
        _ignore_metadata_errors: bool,
    ) -> Result<()> {
        self.read_only(src)
    }

    fn delete_file(&self, path: &VfsPath) -> Result<()> {
        self.read_only(path)
    }

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes> {
        match self.resolve(path, SearchTarget::Both)? {
            Some(found) => Ok(found.fs.attributes(path)? | FileAttributes::READ_ONLY),
            None => Err(FsError::not_found(path)),
        }
    }

    fn set_attributes(&self, path: &VfsPath, _attributes: FileAttributes) -> Result<()> {
        self.read_only(path)
    }

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime> {
        match self.resolve(path, SearchTarget::Both)? {
            Some(found) => found.fs.creation_time(path),
            None => Ok(UNIX_EPOCH),
        }
    }

    fn set_creation_time(&self, path: &VfsPath, _time: SystemTime) -> Result<()> {
        self.read_only(path)
    }

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime> {
        match self.resolve(path, SearchTarget::Both)? {
            Some(found) => found.fs.last_access_time(path),
            None => Ok(UNIX_EPOCH),
        }
    }

    fn set_last_access_time(&self, path: &VfsPath, _time: SystemTime) -> Result<()> {
        self.read_only(path)
    }

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime> {
        match self.resolve(path, SearchTarget::Both)? {
            Some(found) => found.fs.last_write_time(path),
            None => Ok(UNIX_EPOCH),
        }
    }

    fn set_last_write_time(&self, path: &VfsPath, _time: SystemTime) -> Result<()> {
        self.read_only(path)
    }

    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths> {
        // Validate the pattern once up front; layers recompile it.
        SearchPattern::new(pattern)?;
        let mut merged: BTreeSet<VfsPath> = BTreeSet::new();
        for fs in self.candidates() {
            // A layer without the directory contributes nothing.
            if !fs.directory_exists(root).unwrap_or(false) {
                continue;
            }
            match fs.enumerate_paths(root, pattern, recursive, target) {
                Ok(paths) => merged.extend(paths),
                Err(e) => tracing::debug!("aggregate: layer enumeration at {root} skipped: {e}"),
            }
        }
        Ok(Box::new(merged.into_iter()))
    }

    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items> {
        let mut seen: HashSet<VfsPath> = HashSet::new();
        let mut out = Vec::new();
        for fs in self.candidates() {
            if !fs.directory_exists(root).unwrap_or(false) {
                continue;
            }
            let items = match fs.enumerate_items(root, recursive, None) {
                Ok(items) => items,
                Err(e) => {
                    tracing::debug!("aggregate: layer enumeration at {root} skipped: {e}");
                    continue;
                }
            };
            for item in items {
                // First observation wins; shadowed entries are dropped even
                // when the predicate rejects the winner.
                if !seen.insert(item.path.clone()) {
                    continue;
                }
                if predicate.is_none_or(|p| p(&item)) {
                    out.push(item);
                }
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn can_watch(&self, path: &VfsPath) -> bool {
        self.attach_order().iter().any(|fs| fs.can_watch(path))
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        let watcher = AggregateWatcher::new(self.as_dyn(), path.clone());
        self.attach_children(&watcher);
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&watcher));
        let watcher: Arc<dyn Watcher> = watcher;
        Ok(watcher)
    }

    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        match self.resolve(path, SearchTarget::Both)? {
            Some(found) => found.fs.to_host_path(path),
            None => Err(FsError::not_found(path)),
        }
    }

    fn from_host_path(&self, path: &Path) -> Result<VfsPath> {
        for fs in self.candidates() {
            if let Ok(converted) = fs.from_host_path(path) {
                return Ok(converted);
            }
        }
        Err(FsError::invalid_argument(format!(
            "host path {path:?} does not map into any layer"
        )))
    }

    fn as_aggregate(&self) -> Option<&AggregateFileSystem> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemExt;
    use crate::fs::memory::MemoryFileSystem;

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s)
    }

    fn mem_with(files: &[(&str, &str)]) -> Arc<MemoryFileSystem> {
        let fs = MemoryFileSystem::new();
        for (path, contents) in files {
            let path = p(path);
            let parent = path.parent();
            if !parent.is_null() && !parent.is_root() {
                fs.create_dir_all(&parent).unwrap();
            }
            fs.write_bytes(&path, contents.as_bytes()).unwrap();
        }
        fs
    }

    #[test]
    fn test_shadowing_top_layer_wins() {
        let low = mem_with(&[("/a", "one")]);
        let high = mem_with(&[("/a", "two"), ("/b", "b")]);
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(low).unwrap();
        agg.add_filesystem(high).unwrap();

        assert_eq!(agg.read_to_string(&p("/a")).unwrap(), "two");
        assert_eq!(agg.read_to_string(&p("/b")).unwrap(), "b");
    }

    #[test]
    fn test_enumeration_deduplicates() {
        let low = mem_with(&[("/a", "one")]);
        let high = mem_with(&[("/a", "two"), ("/b", "b")]);
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(low).unwrap();
        agg.add_filesystem(high).unwrap();

        let all: Vec<_> = agg
            .enumerate_paths(&p("/"), "*", false, SearchTarget::Both)
            .unwrap()
            .collect();
        assert_eq!(all, vec![p("/a"), p("/b")]);
    }

    #[test]
    fn test_fallback_sits_below_the_stack() {
        let fallback = mem_with(&[("/only-fallback", "fb"), ("/a", "fallback")]);
        let layer = mem_with(&[("/a", "layer")]);
        let agg = AggregateFileSystem::with_fallback(Some(fallback));
        agg.add_filesystem(layer).unwrap();

        assert_eq!(agg.read_to_string(&p("/a")).unwrap(), "layer");
        assert_eq!(agg.read_to_string(&p("/only-fallback")).unwrap(), "fb");
    }

    #[test]
    fn test_writes_rejected() {
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(mem_with(&[("/a", "x")])).unwrap();

        assert!(matches!(
            agg.create_directory(&p("/d")),
            Err(FsError::ReadOnly { .. })
        ));
        assert!(matches!(
            agg.delete_file(&p("/a")),
            Err(FsError::ReadOnly { .. })
        ));
        assert!(matches!(
            agg.open_file(&p("/a"), OpenMode::Create, FileAccess::WRITE, FileShare::empty()),
            Err(FsError::ReadOnly { .. })
        ));
        assert!(matches!(
            agg.open_file(&p("/a"), OpenMode::Open, FileAccess::READ_WRITE, FileShare::empty()),
            Err(FsError::ReadOnly { .. })
        ));
        // Plain readonly open passes through
        assert_eq!(agg.read_to_string(&p("/a")).unwrap(), "x");
    }

    #[test]
    fn test_attributes_forced_read_only_and_epoch_times() {
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(mem_with(&[("/a", "x")])).unwrap();

        let attributes = agg.attributes(&p("/a")).unwrap();
        assert!(attributes.contains(FileAttributes::READ_ONLY));

        // No layer owns the path: times default to the epoch, no error.
        assert_eq!(agg.last_write_time(&p("/missing")).unwrap(), UNIX_EPOCH);
        assert!(matches!(
            agg.attributes(&p("/missing")),
            Err(FsError::NotFound { .. })
        ));
    }

    #[test]
    fn test_self_and_duplicate_registration_rejected() {
        let agg = AggregateFileSystem::new();
        let layer: Arc<dyn FileSystem> = mem_with(&[]);
        agg.add_filesystem(layer.clone()).unwrap();
        assert!(matches!(
            agg.add_filesystem(layer.clone()),
            Err(FsError::InvalidArgument { .. })
        ));
        let self_arc: Arc<dyn FileSystem> = agg.clone();
        assert!(matches!(
            agg.add_filesystem(self_arc),
            Err(FsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_nested_aggregate_short_circuits() {
        // Outer stack: [low, nested]; nested is an empty aggregate. The
        // nested aggregate masks the lower layer even though it holds
        // nothing itself.
        let low = mem_with(&[("/a", "low")]);
        let nested = AggregateFileSystem::new();
        let outer = AggregateFileSystem::new();
        outer.add_filesystem(low).unwrap();
        outer.add_filesystem(nested.clone()).unwrap();

        assert!(!outer.file_exists(&p("/a")).unwrap());

        // Give the nested aggregate its own content and it answers.
        nested.add_filesystem(mem_with(&[("/a", "nested")])).unwrap();
        assert_eq!(outer.read_to_string(&p("/a")).unwrap(), "nested");
    }

    #[test]
    fn test_search_on_non_directory_root_is_empty() {
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(mem_with(&[("/a", "x")])).unwrap();
        let none: Vec<_> = agg
            .enumerate_paths(&p("/not-here"), "*", true, SearchTarget::Both)
            .unwrap()
            .collect();
        assert!(none.is_empty());
    }

    #[test]
    fn test_enumerate_items_first_observed_wins() {
        let low = mem_with(&[("/a", "low-content-long")]);
        let high = mem_with(&[("/a", "hi")]);
        let agg = AggregateFileSystem::new();
        agg.add_filesystem(low).unwrap();
        agg.add_filesystem(high).unwrap();

        let items: Vec<_> = agg.enumerate_items(&p("/"), false, None).unwrap().collect();
        assert_eq!(items.len(), 1);
        // The high-priority layer's entry is the one observed.
        assert_eq!(items[0].length, 2);
    }
}
