use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FsError, Result};
use crate::fs::{
    FileAccess, FileAttributes, FileShare, FileSystem, FsItem, Items, OpenMode, Paths,
    SearchPattern, SearchTarget, VfsFile, same_filesystem,
};
use crate::path::VfsPath;
use crate::watcher::{AggregateWatcher, PathConverter, Watcher, WrapWatcher};

/// A mount-table key: ordered by descending prefix length, then ascending
/// ordinal. Iterating the table therefore visits the longest prefixes first,
/// which is what makes longest-prefix routing a plain scan.
#[derive(Clone, PartialEq, Eq)]
struct MountKey(VfsPath);

impl Ord for MountKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .as_str()
            .len()
            .cmp(&self.0.as_str().len())
            .then_with(|| self.0.as_str().cmp(other.0.as_str()))
    }
}

impl PartialOrd for MountKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Where a path routed to.
struct Routed {
    fs: Arc<dyn FileSystem>,
    /// The matched mount prefix; `None` when routed to the fallback.
    prefix: Option<VfsPath>,
    /// The path in the routed filesystem's own namespace.
    local: VfsPath,
}

impl Routed {
    fn at_mount_root(&self) -> bool {
        self.prefix.is_some() && self.local.is_root()
    }
}

/// The search locations of one directory during enumeration.
struct Locations {
    /// Next path segments of mounts strictly below the directory; each is a
    /// synthetic (virtual) child directory.
    virtuals: BTreeSet<String>,
    concrete: Vec<ConcreteLocation>,
    matched_mount: bool,
}

struct ConcreteLocation {
    fs: Arc<dyn FileSystem>,
    local: VfsPath,
}

/// A prefix router: every operation goes to the filesystem whose registered
/// prefix is the longest prefix of the path, or to the fallback when no
/// prefix matches.
///
/// Ancestors of mount prefixes exist as synthetic "virtual" directories even
/// when no backend is mounted there. Mount roots themselves are protected:
/// they cannot be created over, moved, or deleted through path operations;
/// only `unmount` removes them.
///
/// The mount table and the live-watcher list carry separate locks; whenever
/// both are needed the mount lock is taken (and released) first.
pub struct MountFileSystem {
    this: Weak<MountFileSystem>,
    mounts: Mutex<BTreeMap<MountKey, Arc<dyn FileSystem>>>,
    fallback: Option<Arc<dyn FileSystem>>,
    watchers: Mutex<Vec<Weak<AggregateWatcher>>>,
}

impl MountFileSystem {
    pub fn new() -> Arc<MountFileSystem> {
        Self::with_fallback(None)
    }

    /// A router whose unmatched paths go to `fallback` unchanged.
    pub fn with_fallback(fallback: Option<Arc<dyn FileSystem>>) -> Arc<MountFileSystem> {
        Arc::new_cyclic(|this| MountFileSystem {
            this: this.clone(),
            mounts: Mutex::new(BTreeMap::new()),
            fallback,
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn as_dyn(&self) -> Arc<dyn FileSystem> {
        self.this.upgrade().expect("filesystem self reference")
    }

    pub fn fallback(&self) -> Option<&Arc<dyn FileSystem>> {
        self.fallback.as_ref()
    }

    /// Register `fs` under `prefix`. The prefix must be absolute, not the
    /// root, and not already taken.
    pub fn mount(&self, prefix: impl Into<VfsPath>, fs: Arc<dyn FileSystem>) -> Result<()> {
        let prefix = prefix.into();
        if prefix.is_null() || !prefix.is_absolute() {
            return Err(FsError::invalid_argument(format!(
                "mount prefix {prefix:?} must be absolute"
            )));
        }
        if prefix.is_root() {
            return Err(FsError::invalid_argument("cannot mount over the root"));
        }
        if ptr::addr_eq(Arc::as_ptr(&fs), self as *const MountFileSystem) {
            return Err(FsError::invalid_argument("cannot mount a router into itself"));
        }
        {
            let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            if mounts.contains_key(&MountKey(prefix.clone())) {
                return Err(FsError::invalid_argument(format!(
                    "{prefix} is already mounted"
                )));
            }
            mounts.insert(MountKey(prefix.clone()), fs.clone());
        }
        tracing::debug!("mounted {prefix}");
        for watcher in self.live_watchers() {
            attach_mount_child(&watcher, &prefix, &fs);
        }
        Ok(())
    }

    /// Remove the mount at `prefix`, detaching its watchers.
    pub fn unmount(&self, prefix: &VfsPath) -> Result<()> {
        let removed = {
            let mut mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            mounts
                .remove(&MountKey(prefix.clone()))
                .ok_or_else(|| FsError::invalid_argument(format!("{prefix} is not mounted")))?
        };
        tracing::debug!("unmounted {prefix}");
        for watcher in self.live_watchers() {
            watcher.remove_from(&removed);
        }
        Ok(())
    }

    /// Snapshot of the mount table, longest prefixes first.
    pub fn mounts(&self) -> Vec<(VfsPath, Arc<dyn FileSystem>)> {
        self.mounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, fs)| (key.0.clone(), fs.clone()))
            .collect()
    }

    /// Longest-prefix routing: the first table entry containing `path`
    /// wins, otherwise the fallback takes the path unchanged.
    fn route(&self, path: &VfsPath) -> Result<Option<Routed>> {
        if path.is_null() {
            return Err(FsError::invalid_argument("path is null"));
        }
        {
            let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            for (key, fs) in mounts.iter() {
                if let Some(local) = path.remove_prefix(&key.0) {
                    return Ok(Some(Routed {
                        fs: fs.clone(),
                        prefix: Some(key.0.clone()),
                        local,
                    }));
                }
            }
        }
        Ok(self.fallback.as_ref().map(|fs| Routed {
            fs: fs.clone(),
            prefix: None,
            local: path.clone(),
        }))
    }

    fn route_required(&self, path: &VfsPath) -> Result<Routed> {
        self.route(path)?.ok_or_else(|| FsError::not_found(path))
    }

    /// Whether some mount prefix lies strictly below `path`, making `path`
    /// a virtual directory.
    fn has_mount_below(&self, path: &VfsPath) -> bool {
        let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
        mounts
            .keys()
            .any(|key| key.0 != *path && key.0.remove_prefix(path).is_some())
    }

    /// Compute the search locations of `dir`: virtual children for mounts
    /// below it, a concrete location inside the owning mount, and the
    /// fallback when no mount matched.
    fn search_locations(&self, dir: &VfsPath) -> Result<Locations> {
        let snapshot: Vec<(VfsPath, Arc<dyn FileSystem>)> = {
            let mounts = self.mounts.lock().unwrap_or_else(PoisonError::into_inner);
            mounts
                .iter()
                .map(|(key, fs)| (key.0.clone(), fs.clone()))
                .collect()
        };
        let mut locations = Locations {
            virtuals: BTreeSet::new(),
            concrete: Vec::new(),
            matched_mount: false,
        };
        for (prefix, fs) in &snapshot {
            if prefix != dir
                && let Some(rest) = prefix.remove_prefix(dir)
            {
                if let Some(segment) = rest.first_segment() {
                    locations.virtuals.insert(segment.to_string());
                }
                continue;
            }
            if let Some(local) = dir.remove_prefix(prefix) {
                locations.matched_mount = true;
                if fs.directory_exists(&local)? {
                    locations.concrete.push(ConcreteLocation {
                        fs: fs.clone(),
                        local,
                    });
                }
            }
        }
        if !locations.matched_mount
            && let Some(fallback) = &self.fallback
            && fallback.directory_exists(dir)?
        {
            locations.concrete.push(ConcreteLocation {
                fs: fallback.clone(),
                local: dir.clone(),
            });
        }
        Ok(locations)
    }

    fn live_watchers(&self) -> Vec<Arc<AggregateWatcher>> {
        let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|w| w.strong_count() > 0);
        watchers.iter().filter_map(Weak::upgrade).collect()
    }
}

/// The mount-local path a watcher rooted at `watch_path` covers for a mount
/// at `prefix`: everything when watching the root, the remainder when the
/// watch path sits at or inside the prefix, nothing otherwise.
fn watch_local(watch_path: &VfsPath, prefix: &VfsPath) -> Option<VfsPath> {
    if watch_path.is_root() {
        return Some(VfsPath::root());
    }
    watch_path.remove_prefix(prefix)
}

/// Attach a prefix-rewriting child watcher for one mount, if reachable and
/// watchable. Failures are logged; the rest of the table keeps reporting.
fn attach_mount_child(
    watcher: &Arc<AggregateWatcher>,
    prefix: &VfsPath,
    fs: &Arc<dyn FileSystem>,
) {
    let watch_path = watcher.core().path().clone();
    let Some(local) = watch_local(&watch_path, prefix) else {
        return;
    };
    if !fs.can_watch(&local) {
        return;
    }
    match fs.watch(&local) {
        Ok(child) => {
            let mount_prefix = prefix.clone();
            let convert: PathConverter =
                Arc::new(move |path: &VfsPath| Some(mount_prefix.join(path.to_relative().as_str())));
            let wrap = WrapWatcher::new(fs.clone(), watch_path, child, Some(convert));
            watcher.add(wrap);
        }
        Err(e) => tracing::warn!("mount: failed to attach child watcher for {prefix}: {e}"),
    }
}

fn sort_case_insensitive(entries: &mut [(VfsPath, bool)]) {
    entries.sort_by(|a, b| {
        a.0.as_str()
            .to_lowercase()
            .cmp(&b.0.as_str().to_lowercase())
            .then_with(|| a.0.as_str().cmp(b.0.as_str()))
    });
}

/// Breadth-first merged enumeration over the mount table. Levels are
/// produced lazily: each directory is expanded only when the iterator
/// reaches it, so dropping the iterator abandons the walk.
struct MountSearch {
    fs: Arc<MountFileSystem>,
    pattern: SearchPattern,
    target: SearchTarget,
    recursive: bool,
    queue: VecDeque<VfsPath>,
    emitted: HashSet<VfsPath>,
    ready: VecDeque<VfsPath>,
    delegated: VecDeque<Paths>,
}

impl MountSearch {
    /// Expand one queued directory into ready entries, queued
    /// subdirectories, or a delegated subtree iterator.
    fn process(&mut self, dir: &VfsPath) {
        let locations = match self.fs.search_locations(dir) {
            Ok(locations) => locations,
            // Past the first level a vanished directory contributes nothing.
            Err(e) => {
                tracing::debug!("mount: search under {dir} skipped: {e}");
                return;
            }
        };

        // Fast path: a single concrete location with no virtual children
        // delegates the whole subtree to the mounted filesystem.
        if self.recursive && locations.virtuals.is_empty() && locations.concrete.len() == 1 {
            let location = locations
                .concrete
                .into_iter()
                .next()
                .expect("length checked above");
            match location.fs.enumerate_paths(
                &location.local,
                self.pattern.as_str(),
                true,
                self.target,
            ) {
                Ok(paths) => {
                    let dir = dir.clone();
                    let local = location.local;
                    self.delegated.push_back(Box::new(paths.filter_map(move |path| {
                        let rest = path.remove_prefix(&local)?;
                        Some(if rest.is_root() {
                            dir.clone()
                        } else {
                            dir.join(rest.to_relative().as_str())
                        })
                    })));
                }
                Err(e) => tracing::debug!("mount: delegated search under {dir} skipped: {e}"),
            }
            return;
        }

        let mut entries: Vec<(VfsPath, bool)> = Vec::new();
        for segment in &locations.virtuals {
            let public = dir.join(segment);
            if self.emitted.insert(public.clone()) {
                entries.push((public, true));
            }
        }
        for location in &locations.concrete {
            let items = match location.fs.enumerate_items(&location.local, false, None) {
                Ok(items) => items,
                Err(e) => {
                    tracing::debug!("mount: enumeration under {dir} skipped: {e}");
                    continue;
                }
            };
            for item in items {
                let public = dir.join(item.path.file_name());
                if self.emitted.insert(public.clone()) {
                    entries.push((public, item.is_directory));
                }
            }
        }
        sort_case_insensitive(&mut entries);

        for (public, is_dir) in entries {
            if self.target.accepts(is_dir) && self.pattern.matches(public.file_name()) {
                self.ready.push_back(public.clone());
            }
            if is_dir && self.recursive {
                self.queue.push_back(public);
            }
        }
    }
}

impl Iterator for MountSearch {
    type Item = VfsPath;

    fn next(&mut self) -> Option<VfsPath> {
        loop {
            if let Some(path) = self.ready.pop_front() {
                return Some(path);
            }
            if let Some(delegated) = self.delegated.front_mut() {
                match delegated.next() {
                    Some(path) => {
                        if self.emitted.insert(path.clone()) {
                            return Some(path);
                        }
                    }
                    None => {
                        self.delegated.pop_front();
                    }
                }
                continue;
            }
            let dir = self.queue.pop_front()?;
            self.process(&dir);
        }
    }
}

impl FileSystem for MountFileSystem {
    fn create_directory(&self, path: &VfsPath) -> Result<()> {
        match self.route(path)? {
            Some(routed) => {
                if routed.at_mount_root() {
                    return Err(FsError::unauthorized(format!(
                        "cannot create a directory over the mount point {path}"
                    )));
                }
                routed.fs.create_directory(&routed.local)
            }
            None => Err(FsError::directory_not_found(path)),
        }
    }

    fn directory_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() {
            return Ok(false);
        }
        if path.is_root() {
            return Ok(true);
        }
        if let Some(routed) = self.route(path)?
            && routed.fs.directory_exists(&routed.local)?
        {
            return Ok(true);
        }
        Ok(self.has_mount_below(path))
    }

    fn move_directory(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        let src_routed = self
            .route(src)?
            .ok_or_else(|| FsError::directory_not_found(src))?;
        let dst_routed = self
            .route(dst)?
            .ok_or_else(|| FsError::directory_not_found(dst))?;
        if src_routed.at_mount_root() || dst_routed.at_mount_root() {
            return Err(FsError::unauthorized("cannot move a mount point"));
        }
        if !same_filesystem(&src_routed.fs, &dst_routed.fs) {
            return Err(FsError::not_supported(format!(
                "cannot move a directory across mounts: {src} -> {dst}"
            )));
        }
        src_routed
            .fs
            .move_directory(&src_routed.local, &dst_routed.local)
    }

    fn delete_directory(&self, path: &VfsPath, recursive: bool) -> Result<()> {
        match self.route(path)? {
            Some(routed) => {
                if routed.at_mount_root() {
                    return Err(FsError::unauthorized(format!(
                        "{path} is a mount point; unmount it instead"
                    )));
                }
                routed.fs.delete_directory(&routed.local, recursive)
            }
            None => Err(FsError::directory_not_found(path)),
        }
    }

    fn file_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() || path.is_root() {
            return Ok(false);
        }
        match self.route(path)? {
            Some(routed) => routed.fs.file_exists(&routed.local),
            None => Ok(false),
        }
    }

    fn file_length(&self, path: &VfsPath) -> Result<u64> {
        let routed = self.route_required(path)?;
        routed.fs.file_length(&routed.local)
    }

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<Box<dyn VfsFile>> {
        let routed = self.route_required(path)?;
        routed.fs.open_file(&routed.local, mode, access, share)
    }

    fn copy_file(&self, src: &VfsPath, dst: &VfsPath, overwrite: bool) -> Result<()> {
        let src_routed = self.route(src)?.ok_or_else(|| FsError::not_found(src))?;
        let dst_routed = self
            .route(dst)?
            .ok_or_else(|| FsError::directory_not_found(dst))?;
        if same_filesystem(&src_routed.fs, &dst_routed.fs) {
            src_routed
                .fs
                .copy_file(&src_routed.local, &dst_routed.local, overwrite)
        } else {
            src_routed.fs.copy_file_cross(
                &src_routed.local,
                &*dst_routed.fs,
                &dst_routed.local,
                overwrite,
            )
        }
    }

    fn move_file(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        let src_routed = self.route(src)?.ok_or_else(|| FsError::not_found(src))?;
        let dst_routed = self
            .route(dst)?
            .ok_or_else(|| FsError::directory_not_found(dst))?;
        if same_filesystem(&src_routed.fs, &dst_routed.fs) {
            src_routed.fs.move_file(&src_routed.local, &dst_routed.local)
        } else {
            src_routed
                .fs
                .move_file_cross(&src_routed.local, &*dst_routed.fs, &dst_routed.local)
        }
    }

    fn replace_file(
        &self,
        src: &VfsPath,
        dst: &VfsPath,
        backup: Option<&VfsPath>,
        ignore_metadata_errors: bool,
    ) -> Result<()> {
        let src_routed = self.route(src)?.ok_or_else(|| FsError::not_found(src))?;
        let dst_routed = self.route(dst)?.ok_or_else(|| FsError::not_found(dst))?;
        let backup_routed = match backup {
            Some(backup) => Some(self.route(backup)?.ok_or_else(|| FsError::not_found(backup))?),
            None => None,
        };
        let same = same_filesystem(&src_routed.fs, &dst_routed.fs)
            && backup_routed
                .as_ref()
                .is_none_or(|b| same_filesystem(&src_routed.fs, &b.fs));
        if !same {
            return Err(FsError::not_supported(
                "replace-file requires all paths on the same mount",
            ));
        }
        src_routed.fs.replace_file(
            &src_routed.local,
            &dst_routed.local,
            backup_routed.as_ref().map(|b| &b.local),
            ignore_metadata_errors,
        )
    }

    fn delete_file(&self, path: &VfsPath) -> Result<()> {
        let routed = self.route_required(path)?;
        routed.fs.delete_file(&routed.local)
    }

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes> {
        if path.is_root() {
            return Ok(FileAttributes::DIRECTORY);
        }
        if let Some(routed) = self.route(path)?
            && (routed.fs.directory_exists(&routed.local)?
                || routed.fs.file_exists(&routed.local)?)
        {
            return routed.fs.attributes(&routed.local);
        }
        if self.has_mount_below(path) {
            return Ok(FileAttributes::DIRECTORY);
        }
        Err(FsError::not_found(path))
    }

    fn set_attributes(&self, path: &VfsPath, attributes: FileAttributes) -> Result<()> {
        match self.route(path)? {
            Some(routed) => routed.fs.set_attributes(&routed.local, attributes),
            None if self.has_mount_below(path) => Err(FsError::unauthorized(format!(
                "{path} is a virtual directory"
            ))),
            None => Err(FsError::not_found(path)),
        }
    }

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.stat_time(path, |fs, local| fs.creation_time(local))
    }

    fn set_creation_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.set_time(path, |fs, local| fs.set_creation_time(local, time))
    }

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.stat_time(path, |fs, local| fs.last_access_time(local))
    }

    fn set_last_access_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.set_time(path, |fs, local| fs.set_last_access_time(local, time))
    }

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.stat_time(path, |fs, local| fs.last_write_time(local))
    }

    fn set_last_write_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.set_time(path, |fs, local| fs.set_last_write_time(local, time))
    }

    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths> {
        if root.is_null() {
            return Err(FsError::invalid_argument("search root is null"));
        }
        let pattern = SearchPattern::new(pattern)?;
        // Only the initial root errors on nothing-to-search; deeper levels
        // simply contribute nothing.
        let locations = self.search_locations(root)?;
        if locations.concrete.is_empty() && locations.virtuals.is_empty() && !root.is_root() {
            return Err(FsError::directory_not_found(root));
        }
        Ok(Box::new(MountSearch {
            fs: self.this.upgrade().expect("filesystem self reference"),
            pattern,
            target,
            recursive,
            queue: VecDeque::from([root.clone()]),
            emitted: HashSet::new(),
            ready: VecDeque::new(),
            delegated: VecDeque::new(),
        }))
    }

    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items> {
        if root.is_null() {
            return Err(FsError::invalid_argument("search root is null"));
        }
        let first = self.search_locations(root)?;
        if first.concrete.is_empty() && first.virtuals.is_empty() && !root.is_root() {
            return Err(FsError::directory_not_found(root));
        }

        let mut out: Vec<FsItem> = Vec::new();
        let mut seen: HashSet<VfsPath> = HashSet::new();
        let mut queue: VecDeque<VfsPath> = VecDeque::from([root.clone()]);
        while let Some(dir) = queue.pop_front() {
            let locations = match self.search_locations(&dir) {
                Ok(locations) => locations,
                Err(e) => {
                    tracing::debug!("mount: search under {dir} skipped: {e}");
                    continue;
                }
            };
            let mut level: Vec<FsItem> = Vec::new();
            for segment in &locations.virtuals {
                let public = dir.join(segment);
                if seen.insert(public.clone()) {
                    level.push(FsItem {
                        path: public,
                        is_directory: true,
                        length: 0,
                        attributes: FileAttributes::DIRECTORY,
                        creation_time: UNIX_EPOCH,
                        last_access_time: UNIX_EPOCH,
                        last_write_time: UNIX_EPOCH,
                    });
                }
            }
            for location in &locations.concrete {
                let items = match location.fs.enumerate_items(&location.local, false, None) {
                    Ok(items) => items,
                    Err(e) => {
                        tracing::debug!("mount: enumeration under {dir} skipped: {e}");
                        continue;
                    }
                };
                for mut item in items {
                    let public = dir.join(item.path.file_name());
                    if seen.insert(public.clone()) {
                        item.path = public;
                        level.push(item);
                    }
                }
            }
            level.sort_by(|a, b| {
                a.path
                    .as_str()
                    .to_lowercase()
                    .cmp(&b.path.as_str().to_lowercase())
                    .then_with(|| a.path.as_str().cmp(b.path.as_str()))
            });
            for item in level {
                if item.is_directory && recursive {
                    queue.push_back(item.path.clone());
                }
                if predicate.is_none_or(|p| p(&item)) {
                    out.push(item);
                }
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn can_watch(&self, path: &VfsPath) -> bool {
        let snapshot = self.mounts();
        for (prefix, fs) in &snapshot {
            if let Some(local) = watch_local(path, prefix)
                && fs.can_watch(&local)
            {
                return true;
            }
        }
        self.fallback
            .as_ref()
            .is_some_and(|fallback| fallback.can_watch(path))
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        let watcher = AggregateWatcher::new(self.as_dyn(), path.clone());
        for (prefix, fs) in self.mounts() {
            attach_mount_child(&watcher, &prefix, &fs);
        }
        if let Some(fallback) = &self.fallback
            && fallback.can_watch(path)
        {
            match fallback.watch(path) {
                Ok(child) => watcher.add(child),
                Err(e) => tracing::warn!("mount: failed to attach fallback watcher: {e}"),
            }
        }
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&watcher));
        let watcher: Arc<dyn Watcher> = watcher;
        Ok(watcher)
    }

    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        let routed = self.route_required(path)?;
        routed.fs.to_host_path(&routed.local)
    }

    fn from_host_path(&self, path: &Path) -> Result<VfsPath> {
        for (prefix, fs) in self.mounts() {
            if let Ok(converted) = fs.from_host_path(path) {
                return Ok(prefix.join(converted.to_relative().as_str()));
            }
        }
        if let Some(fallback) = &self.fallback
            && let Ok(converted) = fallback.from_host_path(path)
        {
            return Ok(converted);
        }
        Err(FsError::invalid_argument(format!(
            "host path {path:?} does not map into any mount"
        )))
    }
}

impl MountFileSystem {
    fn stat_time(
        &self,
        path: &VfsPath,
        get: impl Fn(&dyn FileSystem, &VfsPath) -> Result<SystemTime>,
    ) -> Result<SystemTime> {
        if let Some(routed) = self.route(path)?
            && (routed.fs.directory_exists(&routed.local)?
                || routed.fs.file_exists(&routed.local)?)
        {
            return get(&*routed.fs, &routed.local);
        }
        if path.is_root() || self.has_mount_below(path) {
            return Ok(UNIX_EPOCH);
        }
        Err(FsError::not_found(path))
    }

    fn set_time(
        &self,
        path: &VfsPath,
        set: impl Fn(&dyn FileSystem, &VfsPath) -> Result<()>,
    ) -> Result<()> {
        match self.route(path)? {
            Some(routed) => set(&*routed.fs, &routed.local),
            None if self.has_mount_below(path) => Err(FsError::unauthorized(format!(
                "{path} is a virtual directory"
            ))),
            None => Err(FsError::not_found(path)),
        }
    }
}
