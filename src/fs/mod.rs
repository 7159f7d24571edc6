pub mod memory;
mod options;
pub mod physical;

use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub use options::{
    FileAccess, FileAttributes, FileShare, FsItem, OpenMode, SearchPattern, SearchTarget,
};

use crate::error::{FsError, Result};
use crate::path::VfsPath;
use crate::watcher::Watcher;

/// An opened file: a seekable byte stream. Readonly handles report
/// permission errors on write.
pub trait VfsFile: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> VfsFile for T {}

/// A finite sequence of paths produced by an enumeration.
pub type Paths = Box<dyn Iterator<Item = VfsPath> + Send>;

/// A finite sequence of entries produced by `enumerate_items`.
pub type Items = Box<dyn Iterator<Item = FsItem> + Send>;

/// The uniform filesystem capability.
///
/// Every component, leaf backend or composer, implements this trait, and
/// composers hold their children as `Arc<dyn FileSystem>`, so any stack of
/// views looks like a single filesystem to the consumer. All operations are
/// synchronous and may block on underlying I/O.
pub trait FileSystem: Send + Sync {
    // ---- directory operations ----

    fn create_directory(&self, path: &VfsPath) -> Result<()>;

    fn directory_exists(&self, path: &VfsPath) -> Result<bool>;

    fn move_directory(&self, src: &VfsPath, dst: &VfsPath) -> Result<()>;

    /// Delete a directory. With `recursive` false the directory must be
    /// empty.
    fn delete_directory(&self, path: &VfsPath, recursive: bool) -> Result<()>;

    // ---- file operations ----

    fn file_exists(&self, path: &VfsPath) -> Result<bool>;

    fn file_length(&self, path: &VfsPath) -> Result<u64>;

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        share: FileShare,
    ) -> Result<Box<dyn VfsFile>>;

    fn copy_file(&self, src: &VfsPath, dst: &VfsPath, overwrite: bool) -> Result<()>;

    fn move_file(&self, src: &VfsPath, dst: &VfsPath) -> Result<()>;

    /// Replace the contents of `dst` with `src`, optionally keeping the old
    /// `dst` as `backup`. `src` is consumed.
    fn replace_file(
        &self,
        src: &VfsPath,
        dst: &VfsPath,
        backup: Option<&VfsPath>,
        ignore_metadata_errors: bool,
    ) -> Result<()>;

    fn delete_file(&self, path: &VfsPath) -> Result<()>;

    // ---- metadata ----

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes>;

    fn set_attributes(&self, path: &VfsPath, attributes: FileAttributes) -> Result<()>;

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime>;

    fn set_creation_time(&self, path: &VfsPath, time: SystemTime) -> Result<()>;

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime>;

    fn set_last_access_time(&self, path: &VfsPath, time: SystemTime) -> Result<()>;

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime>;

    fn set_last_write_time(&self, path: &VfsPath, time: SystemTime) -> Result<()>;

    // ---- enumeration ----

    /// Enumerate paths under `root` whose leaf name matches `pattern`,
    /// filtered to `target` kinds. The sequence is finite and sorted;
    /// dropping it abandons the walk.
    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths>;

    /// Enumerate entries with their metadata, optionally filtered by a
    /// predicate evaluated during the walk.
    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items>;

    // ---- watching ----

    fn can_watch(&self, _path: &VfsPath) -> bool {
        false
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        let _ = path;
        Err(FsError::not_supported("watching is not supported"))
    }

    // ---- path bridging ----

    /// Convert a VFS path to the host representation backing it.
    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf>;

    /// Convert a host path back into this filesystem's namespace.
    fn from_host_path(&self, path: &Path) -> Result<VfsPath>;

    // ---- capability queries ----

    /// Downcast-style query used by the aggregate short-circuit; composers
    /// that are aggregates answer with themselves.
    fn as_aggregate(&self) -> Option<&crate::compose::AggregateFileSystem> {
        None
    }

    // ---- cross-filesystem helpers ----

    /// Copy a file into another filesystem by streaming bytes, then copy
    /// times and attributes best-effort. Leaves may override with something
    /// smarter; the default is the portable fallback used for cross-mount
    /// copies.
    fn copy_file_cross(
        &self,
        src: &VfsPath,
        dst_fs: &dyn FileSystem,
        dst: &VfsPath,
        overwrite: bool,
    ) -> Result<()> {
        if !self.file_exists(src)? {
            return Err(FsError::not_found(src));
        }
        let dst_parent = dst.parent();
        if !dst_parent.is_null() && !dst_fs.directory_exists(&dst_parent)? {
            return Err(FsError::directory_not_found(&dst_parent));
        }
        if !overwrite && dst_fs.file_exists(dst)? {
            return Err(FsError::exists(dst));
        }

        let mut reader = self.open_file(src, OpenMode::Open, FileAccess::READ, FileShare::READ)?;
        let mut writer =
            dst_fs.open_file(dst, OpenMode::Create, FileAccess::WRITE, FileShare::empty())?;
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        drop(writer);
        drop(reader);

        // Metadata is best-effort: the destination may not support it.
        if let Ok(time) = self.last_write_time(src) {
            let _ = dst_fs.set_last_write_time(dst, time);
        }
        if let Ok(time) = self.last_access_time(src) {
            let _ = dst_fs.set_last_access_time(dst, time);
        }
        if let Ok(attributes) = self.attributes(src) {
            let _ = dst_fs.set_attributes(dst, attributes);
        }
        Ok(())
    }

    /// Move a file into another filesystem: stream a copy, then delete the
    /// source. The destination must not exist and its parent must be a
    /// directory.
    fn move_file_cross(&self, src: &VfsPath, dst_fs: &dyn FileSystem, dst: &VfsPath) -> Result<()> {
        if !self.file_exists(src)? {
            return Err(FsError::not_found(src));
        }
        let dst_parent = dst.parent();
        if !dst_parent.is_null() && !dst_fs.directory_exists(&dst_parent)? {
            return Err(FsError::directory_not_found(&dst_parent));
        }
        if dst_fs.file_exists(dst)? {
            return Err(FsError::exists(dst));
        }
        self.copy_file_cross(src, dst_fs, dst, false)?;
        self.delete_file(src)
    }
}

/// Identity comparison for shared filesystems: true when both `Arc`s point
/// at the same instance.
pub fn same_filesystem(a: &Arc<dyn FileSystem>, b: &Arc<dyn FileSystem>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Convenience operations built on the core capability. Blanket-implemented
/// for every filesystem.
pub trait FileSystemExt: FileSystem {
    /// Read a whole file into memory.
    fn read_bytes(&self, path: &VfsPath) -> Result<Vec<u8>> {
        let mut file = self.open_file(path, OpenMode::Open, FileAccess::READ, FileShare::READ)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read a whole file as UTF-8.
    fn read_to_string(&self, path: &VfsPath) -> Result<String> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes)
            .map_err(|e| FsError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Create or truncate a file with the given contents.
    fn write_bytes(&self, path: &VfsPath, contents: &[u8]) -> Result<()> {
        let mut file = self.open_file(path, OpenMode::Create, FileAccess::WRITE, FileShare::empty())?;
        file.write_all(contents)?;
        file.flush()?;
        Ok(())
    }

    /// Create a directory and any missing ancestors.
    fn create_dir_all(&self, path: &VfsPath) -> Result<()> {
        if path.is_null() {
            return Err(FsError::invalid_argument("path is null"));
        }
        let mut current = VfsPath::root();
        for segment in path.segments() {
            current = current.join(segment);
            if !self.directory_exists(&current)? {
                self.create_directory(&current)?;
            }
        }
        Ok(())
    }
}

impl<T: FileSystem + ?Sized> FileSystemExt for T {}
