use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use super::DelegateFileSystem;
use crate::error::{FsError, Result};
use crate::fs::{
    FileAccess, FileAttributes, FileShare, FileSystem, FsItem, Items, OpenMode, Paths,
    SearchTarget, VfsFile,
};
use crate::path::VfsPath;
use crate::watcher::{PathConverter, Watcher, WrapWatcher};

/// A chrooted view: exposes `{delegate}/subpath` as a root.
///
/// Stateless beyond the immutable subpath. Every operation rewrites its
/// paths into the subtree on the way in and strips the prefix on the way
/// out; a delegate path outside the subtree is a contract violation and
/// surfaces as `InvalidState`.
pub struct SubFileSystem {
    this: Weak<SubFileSystem>,
    inner: Arc<dyn FileSystem>,
    subpath: VfsPath,
}

impl SubFileSystem {
    /// Create a view rooted at `subpath`, which must exist as a directory
    /// in `inner`.
    pub fn new(inner: Arc<dyn FileSystem>, subpath: impl Into<VfsPath>) -> Result<Arc<Self>> {
        let subpath = subpath.into();
        if !subpath.is_absolute() {
            return Err(FsError::invalid_argument(format!(
                "subpath {subpath:?} must be absolute"
            )));
        }
        if !inner.directory_exists(&subpath)? {
            return Err(FsError::directory_not_found(&subpath));
        }
        Ok(Arc::new_cyclic(|this| SubFileSystem {
            this: this.clone(),
            inner,
            subpath,
        }))
    }

    pub fn subpath(&self) -> &VfsPath {
        &self.subpath
    }
}

impl DelegateFileSystem for SubFileSystem {
    fn delegate(&self) -> &Arc<dyn FileSystem> {
        &self.inner
    }

    fn convert_to_delegate(&self, path: &VfsPath) -> Result<VfsPath> {
        if path.is_null() {
            return Err(FsError::invalid_argument("path is null"));
        }
        let path = path.to_absolute();
        Ok(self.subpath.join(path.to_relative().as_str()))
    }

    fn convert_from_delegate(&self, path: &VfsPath) -> Result<VfsPath> {
        path.remove_prefix(&self.subpath).ok_or_else(|| {
            FsError::invalid_state(format!(
                "delegate returned {path}, which is outside {}",
                self.subpath
            ))
        })
    }

    fn as_filesystem(&self) -> Arc<dyn FileSystem> {
        self.this.upgrade().expect("filesystem self reference")
    }

    fn from_delegate_converter(&self) -> PathConverter {
        let subpath = self.subpath.clone();
        Arc::new(move |path: &VfsPath| path.remove_prefix(&subpath))
    }
}

impl FileSystem for SubFileSystem {
    fn create_directory(&self, path: &VfsPath) -> Result<()> {
        self.inner.create_directory(&self.convert_to_delegate(path)?)
    }

    fn directory_exists(&self, path: &VfsPath) -> Result<bool> {
        self.inner.directory_exists(&self.convert_to_delegate(path)?)
    }

    fn move_directory(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        self.inner
            .move_directory(&self.convert_to_delegate(src)?, &self.convert_to_delegate(dst)?)
    }

    fn delete_directory(&self, path: &VfsPath, recursive: bool) -> Result<()> {
        self.inner
            .delete_directory(&self.convert_to_delegate(path)?, recursive)
    }

    fn file_exists(&self, path: &VfsPath) -> Result<bool> {
        self.inner.file_exists(&self.convert_to_delegate(path)?)
    }

    fn file_length(&self, path: &VfsPath) -> Result<u64> {
        self.inner.file_length(&self.convert_to_delegate(path)?)
    }

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<Box<dyn VfsFile>> {
        self.inner
            .open_file(&self.convert_to_delegate(path)?, mode, access, share)
    }

    fn copy_file(&self, src: &VfsPath, dst: &VfsPath, overwrite: bool) -> Result<()> {
        self.inner.copy_file(
            &self.convert_to_delegate(src)?,
            &self.convert_to_delegate(dst)?,
            overwrite,
        )
    }

    fn move_file(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        self.inner
            .move_file(&self.convert_to_delegate(src)?, &self.convert_to_delegate(dst)?)
    }

    fn replace_file(
        &self,
        src: &VfsPath,
        dst: &VfsPath,
        backup: Option<&VfsPath>,
        ignore_metadata_errors: bool,
    ) -> Result<()> {
        let backup = match backup {
            Some(backup) => Some(self.convert_to_delegate(backup)?),
            None => None,
        };
        self.inner.replace_file(
            &self.convert_to_delegate(src)?,
            &self.convert_to_delegate(dst)?,
            backup.as_ref(),
            ignore_metadata_errors,
        )
    }

    fn delete_file(&self, path: &VfsPath) -> Result<()> {
        self.inner.delete_file(&self.convert_to_delegate(path)?)
    }

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes> {
        self.inner.attributes(&self.convert_to_delegate(path)?)
    }

    fn set_attributes(&self, path: &VfsPath, attributes: FileAttributes) -> Result<()> {
        self.inner
            .set_attributes(&self.convert_to_delegate(path)?, attributes)
    }

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.inner.creation_time(&self.convert_to_delegate(path)?)
    }

    fn set_creation_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.inner
            .set_creation_time(&self.convert_to_delegate(path)?, time)
    }

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.inner
            .last_access_time(&self.convert_to_delegate(path)?)
    }

    fn set_last_access_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.inner
            .set_last_access_time(&self.convert_to_delegate(path)?, time)
    }

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime> {
        self.inner.last_write_time(&self.convert_to_delegate(path)?)
    }

    fn set_last_write_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        self.inner
            .set_last_write_time(&self.convert_to_delegate(path)?, time)
    }

    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths> {
        let inner_root = self.convert_to_delegate(root)?;
        let paths = self
            .inner
            .enumerate_paths(&inner_root, pattern, recursive, target)?;
        let mut out = Vec::new();
        for path in paths {
            out.push(self.convert_from_delegate(&path)?);
        }
        Ok(Box::new(out.into_iter()))
    }

    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items> {
        let inner_root = self.convert_to_delegate(root)?;
        let items = self.inner.enumerate_items(&inner_root, recursive, None)?;
        let mut out = Vec::new();
        for mut item in items {
            item.path = self.convert_from_delegate(&item.path)?;
            if predicate.is_none_or(|p| p(&item)) {
                out.push(item);
            }
        }
        Ok(Box::new(out.into_iter()))
    }

    fn can_watch(&self, path: &VfsPath) -> bool {
        match self.convert_to_delegate(path) {
            Ok(inner) => self.inner.can_watch(&inner),
            Err(_) => false,
        }
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        let inner = self.inner.watch(&self.convert_to_delegate(path)?)?;
        let wrap = WrapWatcher::new(
            self.as_filesystem(),
            path.clone(),
            inner,
            Some(self.from_delegate_converter()),
        );
        let watcher: Arc<dyn Watcher> = wrap;
        Ok(watcher)
    }

    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        self.inner.to_host_path(&self.convert_to_delegate(path)?)
    }

    fn from_host_path(&self, path: &Path) -> Result<VfsPath> {
        let inner = self.inner.from_host_path(path)?;
        self.convert_from_delegate(&inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemExt;
    use crate::fs::memory::MemoryFileSystem;
    use crate::watcher::{ChangeKind, WatchEvent};

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s)
    }

    fn backing() -> Arc<MemoryFileSystem> {
        let fs = MemoryFileSystem::new();
        fs.create_dir_all(&p("/root/sub")).unwrap();
        fs.write_bytes(&p("/root/sub/file"), b"payload").unwrap();
        fs
    }

    #[test]
    fn test_chroot_view() {
        let mem = backing();
        let sub = SubFileSystem::new(mem.clone(), "/root/sub").unwrap();

        assert!(sub.file_exists(&p("/file")).unwrap());
        // The delegate path does not leak into the view
        assert!(!sub.file_exists(&p("/root/sub/file")).unwrap());
        assert_eq!(sub.read_to_string(&p("/file")).unwrap(), "payload");
    }

    #[test]
    fn test_missing_subpath_rejected() {
        let mem = MemoryFileSystem::new();
        assert!(matches!(
            SubFileSystem::new(mem.clone(), "/nope"),
            Err(FsError::DirectoryNotFound { .. })
        ));
        assert!(matches!(
            SubFileSystem::new(mem, "relative"),
            Err(FsError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_conversion_round_trip() {
        let mem = backing();
        let sub = SubFileSystem::new(mem, "/root/sub").unwrap();

        for path in ["/", "/file", "/a/b/c"] {
            let path = p(path);
            let inner = sub.convert_to_delegate(&path).unwrap();
            assert_eq!(sub.convert_from_delegate(&inner).unwrap(), path);
        }

        assert!(matches!(
            sub.convert_from_delegate(&p("/elsewhere")),
            Err(FsError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_writes_land_in_subtree() {
        let mem = backing();
        let sub = SubFileSystem::new(mem.clone(), "/root/sub").unwrap();

        sub.create_directory(&p("/dir")).unwrap();
        sub.write_bytes(&p("/dir/new"), b"x").unwrap();
        assert!(mem.file_exists(&p("/root/sub/dir/new")).unwrap());
    }

    #[test]
    fn test_enumeration_is_rebased() {
        let mem = backing();
        let sub = SubFileSystem::new(mem, "/root/sub").unwrap();
        let all: Vec<_> = sub
            .enumerate_paths(&p("/"), "*", true, SearchTarget::Both)
            .unwrap()
            .collect();
        assert_eq!(all, vec![p("/file")]);
    }

    #[test]
    fn test_watch_rebases_events() {
        let mem = backing();
        let sub = SubFileSystem::new(mem.clone(), "/root/sub").unwrap();
        let watcher = sub.watch(&p("/")).unwrap();
        let rx = watcher.core().subscribe();

        // Inside the subtree: visible, rebased
        mem.write_bytes(&p("/root/sub/new"), b"1").unwrap();
        // Outside the subtree: dropped
        mem.write_bytes(&p("/root/other"), b"2").unwrap();

        let changes: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                WatchEvent::Change(c) => Some((c.kind, c.path)),
                _ => None,
            })
            .collect();
        assert!(changes.contains(&(ChangeKind::Created, p("/new"))));
        assert!(changes.iter().all(|(_, path)| !path.as_str().contains("other")));
    }
}
