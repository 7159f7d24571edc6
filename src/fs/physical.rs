use std::fs as stdfs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use filetime::FileTime;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use walkdir::WalkDir;

use crate::error::{FsError, Result};
use crate::fs::{
    FileAccess, FileAttributes, FileShare, FileSystem, FsItem, Items, OpenMode, Paths,
    SearchPattern, SearchTarget, VfsFile,
};
use crate::path::VfsPath;
use crate::watcher::{ChangeKind, Watcher, WatcherCore};

/// A leaf filesystem that maps the virtual namespace onto a host directory.
///
/// The host directory acts as the jail root: `/` is the directory itself and
/// every virtual path resolves strictly inside it. Watching is backed by
/// `notify` with host paths rewritten back into the virtual namespace.
pub struct PhysicalFileSystem {
    this: Weak<PhysicalFileSystem>,
    host_root: PathBuf,
}

impl PhysicalFileSystem {
    /// Expose `host_root` (which must be an existing directory) as a
    /// virtual root.
    pub fn new(host_root: impl AsRef<Path>) -> Result<Arc<PhysicalFileSystem>> {
        let host_root = host_root
            .as_ref()
            .canonicalize()
            .map_err(|e| map_host_io(host_root.as_ref(), e))?;
        if !host_root.is_dir() {
            return Err(FsError::Io(io::ErrorKind::NotADirectory.into()));
        }
        Ok(Arc::new_cyclic(|this| PhysicalFileSystem {
            this: this.clone(),
            host_root,
        }))
    }

    pub fn host_root(&self) -> &Path {
        &self.host_root
    }

    fn as_dyn(&self) -> Arc<dyn FileSystem> {
        self.this.upgrade().expect("filesystem self reference")
    }

    fn host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Err(FsError::invalid_argument(format!(
                "path {path:?} must be absolute"
            )));
        }
        if path.is_root() {
            return Ok(self.host_root.clone());
        }
        Ok(self.host_root.join(path.to_relative().as_str()))
    }

    fn vfs_path(&self, host: &Path) -> Option<VfsPath> {
        let rel = host.strip_prefix(&self.host_root).ok()?;
        let rel = rel.to_str()?;
        Some(VfsPath::root().join(rel))
    }
}

fn map_host_io(path: &Path, e: io::Error) -> FsError {
    tracing::debug!("host i/o error at {}: {}", path.display(), e);
    FsError::Io(e)
}

/// Map an I/O error for an operation that required the path to exist.
fn map_io(path: &VfsPath, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::not_found(path),
        io::ErrorKind::AlreadyExists => FsError::exists(path),
        io::ErrorKind::PermissionDenied => {
            FsError::unauthorized(format!("access denied at {path}"))
        }
        _ => FsError::Io(e),
    }
}

impl FileSystem for PhysicalFileSystem {
    fn create_directory(&self, path: &VfsPath) -> Result<()> {
        let host = self.host_path(path)?;
        stdfs::create_dir(&host).map_err(|e| map_io(path, e))
    }

    fn directory_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() {
            return Ok(false);
        }
        Ok(self.host_path(path)?.is_dir())
    }

    fn move_directory(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        let host_src = self.host_path(src)?;
        let host_dst = self.host_path(dst)?;
        if !host_src.is_dir() {
            return Err(FsError::directory_not_found(src));
        }
        if host_dst.exists() {
            return Err(FsError::exists(dst));
        }
        stdfs::rename(&host_src, &host_dst).map_err(|e| map_io(src, e))
    }

    fn delete_directory(&self, path: &VfsPath, recursive: bool) -> Result<()> {
        let host = self.host_path(path)?;
        if !host.is_dir() {
            return Err(FsError::directory_not_found(path));
        }
        if recursive {
            stdfs::remove_dir_all(&host).map_err(|e| map_io(path, e))
        } else {
            stdfs::remove_dir(&host).map_err(|e| map_io(path, e))
        }
    }

    fn file_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() {
            return Ok(false);
        }
        Ok(self.host_path(path)?.is_file())
    }

    fn file_length(&self, path: &VfsPath) -> Result<u64> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        if meta.is_dir() {
            return Err(FsError::not_found(path));
        }
        Ok(meta.len())
    }

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        _share: FileShare,
    ) -> Result<Box<dyn VfsFile>> {
        let host = self.host_path(path)?;
        let wants_write = access.contains(FileAccess::WRITE);
        let needs_write = matches!(
            mode,
            OpenMode::Create | OpenMode::CreateNew | OpenMode::Truncate | OpenMode::Append
        );
        if needs_write && !wants_write {
            return Err(FsError::invalid_argument(format!(
                "mode {mode:?} requires write access"
            )));
        }

        let mut options = stdfs::OpenOptions::new();
        options.read(access.contains(FileAccess::READ));
        options.write(wants_write);
        match mode {
            OpenMode::Open => {}
            OpenMode::OpenOrCreate => {
                options.create(true);
            }
            OpenMode::Create => {
                options.create(true).truncate(true);
            }
            OpenMode::CreateNew => {
                options.create_new(true);
            }
            OpenMode::Truncate => {
                options.truncate(true);
            }
            OpenMode::Append => {
                options.append(true).create(true);
            }
        }
        let file = options.open(&host).map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    fn copy_file(&self, src: &VfsPath, dst: &VfsPath, overwrite: bool) -> Result<()> {
        let host_src = self.host_path(src)?;
        let host_dst = self.host_path(dst)?;
        if !host_src.is_file() {
            return Err(FsError::not_found(src));
        }
        if host_dst.exists() && !overwrite {
            return Err(FsError::exists(dst));
        }
        stdfs::copy(&host_src, &host_dst).map_err(|e| map_io(dst, e))?;
        Ok(())
    }

    fn move_file(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        let host_src = self.host_path(src)?;
        let host_dst = self.host_path(dst)?;
        if !host_src.is_file() {
            return Err(FsError::not_found(src));
        }
        if host_dst.exists() {
            return Err(FsError::exists(dst));
        }
        stdfs::rename(&host_src, &host_dst).map_err(|e| map_io(src, e))
    }

    fn replace_file(
        &self,
        src: &VfsPath,
        dst: &VfsPath,
        backup: Option<&VfsPath>,
        ignore_metadata_errors: bool,
    ) -> Result<()> {
        let host_src = self.host_path(src)?;
        let host_dst = self.host_path(dst)?;
        if !host_src.is_file() {
            return Err(FsError::not_found(src));
        }
        if !host_dst.is_file() {
            return Err(FsError::not_found(dst));
        }
        let old_times = stdfs::metadata(&host_dst).ok().map(|m| {
            (
                FileTime::from_last_access_time(&m),
                FileTime::from_last_modification_time(&m),
            )
        });
        match backup {
            Some(backup) => {
                let host_backup = self.host_path(backup)?;
                if host_backup.exists() {
                    stdfs::remove_file(&host_backup).map_err(|e| map_io(backup, e))?;
                }
                stdfs::rename(&host_dst, &host_backup).map_err(|e| map_io(dst, e))?;
            }
            None => {
                stdfs::remove_file(&host_dst).map_err(|e| map_io(dst, e))?;
            }
        }
        stdfs::rename(&host_src, &host_dst).map_err(|e| map_io(src, e))?;
        // Replacement keeps the destination's timestamps, like the platform
        // replace-file primitives do.
        if let Some((atime, mtime)) = old_times
            && let Err(e) = filetime::set_file_times(&host_dst, atime, mtime)
        {
            if !ignore_metadata_errors {
                return Err(FsError::Io(e));
            }
            tracing::debug!("ignoring metadata error while replacing {dst}: {e}");
        }
        Ok(())
    }

    fn delete_file(&self, path: &VfsPath) -> Result<()> {
        let host = self.host_path(path)?;
        stdfs::remove_file(&host).map_err(|e| map_io(path, e))
    }

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        Ok(attributes_from(&meta))
    }

    fn set_attributes(&self, path: &VfsPath, attributes: FileAttributes) -> Result<()> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        let mut perms = meta.permissions();
        perms.set_readonly(attributes.contains(FileAttributes::READ_ONLY));
        stdfs::set_permissions(&host, perms).map_err(|e| map_io(path, e))
    }

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        Ok(meta.created().unwrap_or(UNIX_EPOCH))
    }

    fn set_creation_time(&self, _path: &VfsPath, _time: SystemTime) -> Result<()> {
        Err(FsError::not_supported(
            "creation time cannot be set on the host filesystem",
        ))
    }

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        Ok(meta.accessed().unwrap_or(UNIX_EPOCH))
    }

    fn set_last_access_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        let host = self.host_path(path)?;
        filetime::set_file_atime(&host, FileTime::from_system_time(time))
            .map_err(|e| map_io(path, e))
    }

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime> {
        let host = self.host_path(path)?;
        let meta = stdfs::metadata(&host).map_err(|e| map_io(path, e))?;
        Ok(meta.modified().unwrap_or(UNIX_EPOCH))
    }

    fn set_last_write_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        let host = self.host_path(path)?;
        filetime::set_file_mtime(&host, FileTime::from_system_time(time))
            .map_err(|e| map_io(path, e))
    }

    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths> {
        let pattern = SearchPattern::new(pattern)?;
        let host_root = self.host_path(root)?;
        if !host_root.is_dir() {
            return Err(FsError::directory_not_found(root));
        }
        let mut out = Vec::new();
        let max_depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&host_root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("skipping unreadable entry under {root}: {e}");
                    continue;
                }
            };
            let Some(path) = self.vfs_path(entry.path()) else {
                continue;
            };
            let is_dir = entry.file_type().is_dir();
            if target.accepts(is_dir) && pattern.matches(path.file_name()) {
                out.push(path);
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items> {
        let host_root = self.host_path(root)?;
        if !host_root.is_dir() {
            return Err(FsError::directory_not_found(root));
        }
        let mut out = Vec::new();
        let max_depth = if recursive { usize::MAX } else { 1 };
        for entry in WalkDir::new(&host_root)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("skipping unreadable entry under {root}: {e}");
                    continue;
                }
            };
            let Some(path) = self.vfs_path(entry.path()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let item = FsItem {
                path,
                is_directory: meta.is_dir(),
                length: if meta.is_dir() { 0 } else { meta.len() },
                attributes: attributes_from(&meta),
                creation_time: meta.created().unwrap_or(UNIX_EPOCH),
                last_access_time: meta.accessed().unwrap_or(UNIX_EPOCH),
                last_write_time: meta.modified().unwrap_or(UNIX_EPOCH),
            };
            if predicate.is_none_or(|p| p(&item)) {
                out.push(item);
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn can_watch(&self, path: &VfsPath) -> bool {
        self.host_path(path).map(|host| host.is_dir()).unwrap_or(false)
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        let host = self.host_path(path)?;
        let core = Arc::new(WatcherCore::new(self.as_dyn(), path.clone()));
        let weak = Arc::downgrade(&core);
        let host_root = self.host_root.clone();

        let mut notify_watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let Some(core) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok(event) => dispatch_notify_event(&core, &host_root, event),
                    Err(e) => core.raise_error(e.to_string()),
                }
            },
            Config::default(),
        )
        .map_err(|e| FsError::Io(io::Error::other(e)))?;
        notify_watcher
            .watch(&host, RecursiveMode::Recursive)
            .map_err(|e| FsError::Io(io::Error::other(e)))?;

        let watcher: Arc<dyn Watcher> = Arc::new(PhysicalWatcher {
            core,
            _notify: Mutex::new(notify_watcher),
        });
        Ok(watcher)
    }

    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        self.host_path(path)
    }

    fn from_host_path(&self, path: &Path) -> Result<VfsPath> {
        self.vfs_path(path).ok_or_else(|| {
            FsError::invalid_argument(format!(
                "host path {path:?} is outside {}",
                self.host_root.display()
            ))
        })
    }
}

fn attributes_from(meta: &stdfs::Metadata) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if meta.is_dir() {
        attributes |= FileAttributes::DIRECTORY;
    }
    if meta.permissions().readonly() {
        attributes |= FileAttributes::READ_ONLY;
    }
    if attributes.is_empty() {
        attributes = FileAttributes::NORMAL;
    }
    attributes
}

/// Translate a notify event into VFS change events on `core`.
fn dispatch_notify_event(core: &WatcherCore, host_root: &Path, event: Event) {
    let to_vfs = |host: &Path| -> Option<VfsPath> {
        let rel = host.strip_prefix(host_root).ok()?;
        Some(VfsPath::root().join(rel.to_str()?))
    };

    match event.kind {
        EventKind::Create(_) => {
            for host in &event.paths {
                if let Some(path) = to_vfs(host) {
                    core.raise(ChangeKind::Created, path, None);
                }
            }
        }
        EventKind::Remove(_) => {
            for host in &event.paths {
                if let Some(path) = to_vfs(host) {
                    core.raise(ChangeKind::Deleted, path, None);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice()
                && let (Some(old), Some(new)) = (to_vfs(from), to_vfs(to))
            {
                core.raise(ChangeKind::Renamed, new, Some(old));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for host in &event.paths {
                if let Some(path) = to_vfs(host) {
                    core.raise(ChangeKind::Deleted, path, None);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for host in &event.paths {
                if let Some(path) = to_vfs(host) {
                    core.raise(ChangeKind::Created, path, None);
                }
            }
        }
        EventKind::Modify(_) => {
            for host in &event.paths {
                if let Some(path) = to_vfs(host) {
                    core.raise(ChangeKind::Changed, path, None);
                }
            }
        }
        _ => {}
    }
}

/// Keeps the notify backend alive for as long as the watcher is held.
struct PhysicalWatcher {
    core: Arc<WatcherCore>,
    _notify: Mutex<RecommendedWatcher>,
}

impl Watcher for PhysicalWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }
}
