use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::SystemTime;

use crate::error::{FsError, Result};
use crate::fs::{
    FileAccess, FileAttributes, FileShare, FileSystem, FsItem, Items, OpenMode, Paths,
    SearchPattern, SearchTarget, VfsFile,
};
use crate::path::VfsPath;
use crate::watcher::{ChangeKind, Watcher, WatcherCore};

/// A thread-safe in-memory filesystem.
///
/// The whole tree lives behind one `RwLock`; file contents are shared byte
/// buffers, so open handles observe writes made through other handles. Every
/// mutation raises a change event on the live watchers of this filesystem.
pub struct MemoryFileSystem {
    this: Weak<MemoryFileSystem>,
    root: RwLock<DirNode>,
    watchers: Mutex<Vec<Weak<WatcherCore>>>,
}

struct NodeMeta {
    attributes: FileAttributes,
    creation: SystemTime,
    last_access: SystemTime,
    last_write: SystemTime,
}

impl NodeMeta {
    fn new(attributes: FileAttributes) -> Self {
        let now = SystemTime::now();
        NodeMeta {
            attributes,
            creation: now,
            last_access: now,
            last_write: now,
        }
    }
}

struct FileNode {
    data: Arc<RwLock<Vec<u8>>>,
    meta: NodeMeta,
}

struct DirNode {
    children: BTreeMap<String, Node>,
    meta: NodeMeta,
}

impl DirNode {
    fn new() -> Self {
        DirNode {
            children: BTreeMap::new(),
            meta: NodeMeta::new(FileAttributes::DIRECTORY),
        }
    }
}

enum Node {
    Dir(DirNode),
    File(FileNode),
}

impl Node {
    fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    fn meta(&self) -> &NodeMeta {
        match self {
            Node::Dir(d) => &d.meta,
            Node::File(f) => &f.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut NodeMeta {
        match self {
            Node::Dir(d) => &mut d.meta,
            Node::File(f) => &mut f.meta,
        }
    }
}

/// Walk to the node at `path`. `None` when anything along the way is
/// missing or not a directory. The root itself is not a `Node`; callers
/// special-case it.
fn find<'a>(root: &'a DirNode, path: &VfsPath) -> Option<&'a Node> {
    let segments: Vec<&str> = path.segments().collect();
    let (last, init) = segments.split_last()?;
    let mut dir = root;
    for segment in init {
        dir = match dir.children.get(*segment) {
            Some(Node::Dir(d)) => d,
            _ => return None,
        };
    }
    dir.children.get(*last)
}

fn find_mut<'a>(root: &'a mut DirNode, path: &VfsPath) -> Option<&'a mut Node> {
    let segments: Vec<&str> = path.segments().collect();
    let (last, init) = segments.split_last()?;
    let mut dir = root;
    for segment in init {
        dir = match dir.children.get_mut(*segment) {
            Some(Node::Dir(d)) => d,
            _ => return None,
        };
    }
    dir.children.get_mut(*last)
}

/// Walk to the directory containing `path`'s leaf, returning it and the
/// leaf name.
fn parent_dir_mut<'a>(root: &'a mut DirNode, path: &VfsPath) -> Result<(&'a mut DirNode, String)> {
    let segments: Vec<&str> = path.segments().collect();
    let Some((last, init)) = segments.split_last() else {
        return Err(FsError::invalid_argument(format!(
            "path {path} has no name segment"
        )));
    };
    let mut dir = root;
    for segment in init {
        dir = match dir.children.get_mut(*segment) {
            Some(Node::Dir(d)) => d,
            _ => return Err(FsError::directory_not_found(&path.parent())),
        };
    }
    Ok((dir, (*last).to_string()))
}

fn check_absolute(path: &VfsPath) -> Result<()> {
    if !path.is_absolute() {
        return Err(FsError::invalid_argument(format!(
            "path {path:?} must be absolute"
        )));
    }
    Ok(())
}

impl MemoryFileSystem {
    pub fn new() -> Arc<MemoryFileSystem> {
        Arc::new_cyclic(|this| MemoryFileSystem {
            this: this.clone(),
            root: RwLock::new(DirNode::new()),
            watchers: Mutex::new(Vec::new()),
        })
    }

    fn as_dyn(&self) -> Arc<dyn FileSystem> {
        self.this.upgrade().expect("filesystem self reference")
    }

    fn tree(&self) -> std::sync::RwLockReadGuard<'_, DirNode> {
        self.root.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tree_mut(&self) -> std::sync::RwLockWriteGuard<'_, DirNode> {
        self.root.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a change to every live watcher, pruning dead ones. Callers
    /// must not hold the tree lock.
    fn emit(&self, kind: ChangeKind, path: &VfsPath, old_path: Option<&VfsPath>) {
        let cores: Vec<Arc<WatcherCore>> = {
            let mut watchers = self.watchers.lock().unwrap_or_else(PoisonError::into_inner);
            watchers.retain(|w| w.strong_count() > 0);
            watchers.iter().filter_map(Weak::upgrade).collect()
        };
        for core in cores {
            core.raise(kind, path.clone(), old_path.cloned());
        }
    }

    /// Update the write time after a handle flushed changes.
    fn file_written(&self, path: &VfsPath) {
        {
            let mut tree = self.tree_mut();
            if let Some(node) = find_mut(&mut tree, path) {
                node.meta_mut().last_write = SystemTime::now();
            }
        }
        self.emit(ChangeKind::Changed, path, None);
    }
}

impl FileSystem for MemoryFileSystem {
    fn create_directory(&self, path: &VfsPath) -> Result<()> {
        check_absolute(path)?;
        if path.is_root() {
            return Err(FsError::exists(path));
        }
        {
            let mut tree = self.tree_mut();
            let (parent, name) = parent_dir_mut(&mut tree, path)?;
            if parent.children.contains_key(&name) {
                return Err(FsError::exists(path));
            }
            parent.children.insert(name, Node::Dir(DirNode::new()));
        }
        self.emit(ChangeKind::Created, path, None);
        Ok(())
    }

    fn directory_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() {
            return Ok(false);
        }
        check_absolute(path)?;
        if path.is_root() {
            return Ok(true);
        }
        Ok(matches!(find(&self.tree(), path), Some(node) if node.is_dir()))
    }

    fn move_directory(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        check_absolute(src)?;
        check_absolute(dst)?;
        if src.is_root() || dst.is_root() {
            return Err(FsError::unauthorized("cannot move the root directory"));
        }
        if dst.is_in_directory(src, true) {
            return Err(FsError::invalid_argument(format!(
                "cannot move {src} into itself"
            )));
        }
        {
            let mut tree = self.tree_mut();
            match find(&tree, src) {
                Some(node) if node.is_dir() => {}
                _ => return Err(FsError::directory_not_found(src)),
            }
            if find(&tree, dst).is_some() {
                return Err(FsError::exists(dst));
            }
            // Detach, then attach under the destination parent.
            let node = {
                let (parent, name) = parent_dir_mut(&mut tree, src)?;
                parent.children.remove(&name).expect("checked above")
            };
            let (parent, name) = match parent_dir_mut(&mut tree, dst) {
                Ok(found) => found,
                Err(e) => {
                    // Re-attach on failure so the tree stays intact.
                    let (src_parent, src_name) = parent_dir_mut(&mut tree, src)?;
                    src_parent.children.insert(src_name, node);
                    return Err(e);
                }
            };
            parent.children.insert(name, node);
        }
        self.emit(ChangeKind::Renamed, dst, Some(src));
        Ok(())
    }

    fn delete_directory(&self, path: &VfsPath, recursive: bool) -> Result<()> {
        check_absolute(path)?;
        if path.is_root() {
            return Err(FsError::unauthorized("cannot delete the root directory"));
        }
        {
            let mut tree = self.tree_mut();
            match find(&tree, path) {
                Some(Node::Dir(dir)) => {
                    if !recursive && !dir.children.is_empty() {
                        return Err(FsError::Io(io::ErrorKind::DirectoryNotEmpty.into()));
                    }
                }
                _ => return Err(FsError::directory_not_found(path)),
            }
            let (parent, name) = parent_dir_mut(&mut tree, path)?;
            parent.children.remove(&name);
        }
        self.emit(ChangeKind::Deleted, path, None);
        Ok(())
    }

    fn file_exists(&self, path: &VfsPath) -> Result<bool> {
        if path.is_null() || path.is_root() {
            return Ok(false);
        }
        check_absolute(path)?;
        Ok(matches!(find(&self.tree(), path), Some(node) if !node.is_dir()))
    }

    fn file_length(&self, path: &VfsPath) -> Result<u64> {
        check_absolute(path)?;
        let tree = self.tree();
        match find(&tree, path) {
            Some(Node::File(file)) => Ok(file
                .data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len() as u64),
            _ => Err(FsError::not_found(path)),
        }
    }

    fn open_file(
        &self,
        path: &VfsPath,
        mode: OpenMode,
        access: FileAccess,
        _share: FileShare,
    ) -> Result<Box<dyn VfsFile>> {
        check_absolute(path)?;
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

        let mut created = false;
        let data = {
            let mut tree = self.tree_mut();
            let (parent, name) = parent_dir_mut(&mut tree, path)?;
            match parent.children.get_mut(&name) {
                Some(Node::Dir(_)) => {
                    return Err(FsError::unauthorized(format!("{path} is a directory")));
                }
                Some(Node::File(file)) => {
                    if mode == OpenMode::CreateNew {
                        return Err(FsError::exists(path));
                    }
                    if wants_write && file.meta.attributes.contains(FileAttributes::READ_ONLY) {
                        return Err(FsError::unauthorized(format!("{path} is read-only")));
                    }
                    if matches!(mode, OpenMode::Create | OpenMode::Truncate) {
                        file.data
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .clear();
                    }
                    file.meta.last_access = SystemTime::now();
                    file.data.clone()
                }
                None => {
                    if matches!(mode, OpenMode::Open | OpenMode::Truncate) {
                        return Err(FsError::not_found(path));
                    }
                    let file = FileNode {
                        data: Arc::new(RwLock::new(Vec::new())),
                        meta: NodeMeta::new(FileAttributes::NORMAL),
                    };
                    let data = file.data.clone();
                    parent.children.insert(name, Node::File(file));
                    created = true;
                    data
                }
            }
        };
        if created {
            self.emit(ChangeKind::Created, path, None);
        }

        let position = if mode == OpenMode::Append {
            data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
        } else {
            0
        };
        Ok(Box::new(MemFile {
            fs: self.this.upgrade().expect("filesystem self reference"),
            path: path.clone(),
            data,
            position,
            readable: access.contains(FileAccess::READ),
            writable: wants_write,
            append: mode == OpenMode::Append,
            dirty: false,
        }))
    }

    fn copy_file(&self, src: &VfsPath, dst: &VfsPath, overwrite: bool) -> Result<()> {
        check_absolute(src)?;
        check_absolute(dst)?;
        let mut replaced = false;
        {
            let mut tree = self.tree_mut();
            let bytes = match find(&tree, src) {
                Some(Node::File(file)) => file
                    .data
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone(),
                _ => return Err(FsError::not_found(src)),
            };
            let (parent, name) = parent_dir_mut(&mut tree, dst)?;
            match parent.children.get(&name) {
                Some(Node::Dir(_)) => {
                    return Err(FsError::unauthorized(format!("{dst} is a directory")));
                }
                Some(Node::File(existing)) => {
                    if !overwrite {
                        return Err(FsError::exists(dst));
                    }
                    if existing.meta.attributes.contains(FileAttributes::READ_ONLY) {
                        return Err(FsError::unauthorized(format!("{dst} is read-only")));
                    }
                    replaced = true;
                }
                None => {}
            }
            parent.children.insert(
                name,
                Node::File(FileNode {
                    data: Arc::new(RwLock::new(bytes)),
                    meta: NodeMeta::new(FileAttributes::NORMAL),
                }),
            );
        }
        let kind = if replaced {
            ChangeKind::Changed
        } else {
            ChangeKind::Created
        };
        self.emit(kind, dst, None);
        Ok(())
    }

    fn move_file(&self, src: &VfsPath, dst: &VfsPath) -> Result<()> {
        check_absolute(src)?;
        check_absolute(dst)?;
        {
            let mut tree = self.tree_mut();
            match find(&tree, src) {
                Some(Node::File(_)) => {}
                _ => return Err(FsError::not_found(src)),
            }
            if find(&tree, dst).is_some() {
                return Err(FsError::exists(dst));
            }
            let node = {
                let (parent, name) = parent_dir_mut(&mut tree, src)?;
                parent.children.remove(&name).expect("checked above")
            };
            let (parent, name) = match parent_dir_mut(&mut tree, dst) {
                Ok(found) => found,
                Err(e) => {
                    let (src_parent, src_name) = parent_dir_mut(&mut tree, src)?;
                    src_parent.children.insert(src_name, node);
                    return Err(e);
                }
            };
            parent.children.insert(name, node);
        }
        self.emit(ChangeKind::Renamed, dst, Some(src));
        Ok(())
    }

    fn replace_file(
        &self,
        src: &VfsPath,
        dst: &VfsPath,
        backup: Option<&VfsPath>,
        _ignore_metadata_errors: bool,
    ) -> Result<()> {
        check_absolute(src)?;
        check_absolute(dst)?;
        {
            let mut tree = self.tree_mut();
            match (find(&tree, src), find(&tree, dst)) {
                (Some(Node::File(_)), Some(Node::File(_))) => {}
                (Some(Node::File(_)), _) => return Err(FsError::not_found(dst)),
                _ => return Err(FsError::not_found(src)),
            }
            // Pull the source out first; then retire or back up the old
            // destination.
            let src_node = {
                let (parent, name) = parent_dir_mut(&mut tree, src)?;
                parent.children.remove(&name).expect("checked above")
            };
            let dst_node = {
                let (parent, name) = parent_dir_mut(&mut tree, dst)?;
                parent.children.remove(&name).expect("checked above")
            };
            if let Some(backup) = backup {
                check_absolute(backup)?;
                let (parent, name) = parent_dir_mut(&mut tree, backup)?;
                parent.children.insert(name, dst_node);
            }
            let (parent, name) = parent_dir_mut(&mut tree, dst)?;
            parent.children.insert(name, src_node);
        }
        self.emit(ChangeKind::Deleted, src, None);
        self.emit(ChangeKind::Changed, dst, None);
        if let Some(backup) = backup {
            self.emit(ChangeKind::Created, backup, None);
        }
        Ok(())
    }

    fn delete_file(&self, path: &VfsPath) -> Result<()> {
        check_absolute(path)?;
        {
            let mut tree = self.tree_mut();
            let (parent, name) = parent_dir_mut(&mut tree, path)?;
            match parent.children.get(&name) {
                Some(Node::File(file)) => {
                    if file.meta.attributes.contains(FileAttributes::READ_ONLY) {
                        return Err(FsError::unauthorized(format!("{path} is read-only")));
                    }
                }
                _ => return Err(FsError::not_found(path)),
            }
            parent.children.remove(&name);
        }
        self.emit(ChangeKind::Deleted, path, None);
        Ok(())
    }

    fn attributes(&self, path: &VfsPath) -> Result<FileAttributes> {
        check_absolute(path)?;
        if path.is_root() {
            return Ok(FileAttributes::DIRECTORY);
        }
        let tree = self.tree();
        match find(&tree, path) {
            Some(node) => Ok(node.meta().attributes),
            None => Err(FsError::not_found(path)),
        }
    }

    fn set_attributes(&self, path: &VfsPath, attributes: FileAttributes) -> Result<()> {
        check_absolute(path)?;
        {
            let mut tree = self.tree_mut();
            let Some(node) = find_mut(&mut tree, path) else {
                return Err(FsError::not_found(path));
            };
            // The directory bit reflects the node kind and cannot be edited.
            let dir_bit = node.meta().attributes & FileAttributes::DIRECTORY;
            node.meta_mut().attributes = (attributes - FileAttributes::DIRECTORY) | dir_bit;
        }
        self.emit(ChangeKind::Changed, path, None);
        Ok(())
    }

    fn creation_time(&self, path: &VfsPath) -> Result<SystemTime> {
        check_absolute(path)?;
        let tree = self.tree();
        if path.is_root() {
            return Ok(tree.meta.creation);
        }
        match find(&tree, path) {
            Some(node) => Ok(node.meta().creation),
            None => Err(FsError::not_found(path)),
        }
    }

    fn set_creation_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        check_absolute(path)?;
        let mut tree = self.tree_mut();
        match find_mut(&mut tree, path) {
            Some(node) => {
                node.meta_mut().creation = time;
                Ok(())
            }
            None => Err(FsError::not_found(path)),
        }
    }

    fn last_access_time(&self, path: &VfsPath) -> Result<SystemTime> {
        check_absolute(path)?;
        let tree = self.tree();
        if path.is_root() {
            return Ok(tree.meta.last_access);
        }
        match find(&tree, path) {
            Some(node) => Ok(node.meta().last_access),
            None => Err(FsError::not_found(path)),
        }
    }

    fn set_last_access_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        check_absolute(path)?;
        let mut tree = self.tree_mut();
        match find_mut(&mut tree, path) {
            Some(node) => {
                node.meta_mut().last_access = time;
                Ok(())
            }
            None => Err(FsError::not_found(path)),
        }
    }

    fn last_write_time(&self, path: &VfsPath) -> Result<SystemTime> {
        check_absolute(path)?;
        let tree = self.tree();
        if path.is_root() {
            return Ok(tree.meta.last_write);
        }
        match find(&tree, path) {
            Some(node) => Ok(node.meta().last_write),
            None => Err(FsError::not_found(path)),
        }
    }

    fn set_last_write_time(&self, path: &VfsPath, time: SystemTime) -> Result<()> {
        check_absolute(path)?;
        let mut tree = self.tree_mut();
        match find_mut(&mut tree, path) {
            Some(node) => {
                node.meta_mut().last_write = time;
                Ok(())
            }
            None => Err(FsError::not_found(path)),
        }
    }

    fn enumerate_paths(
        &self,
        root: &VfsPath,
        pattern: &str,
        recursive: bool,
        target: SearchTarget,
    ) -> Result<Paths> {
        let pattern = SearchPattern::new(pattern)?;
        let entries = self.collect_entries(root, recursive)?;
        let paths: Vec<VfsPath> = entries
            .into_iter()
            .filter(|(path, is_dir)| {
                target.accepts(*is_dir) && pattern.matches(path.file_name())
            })
            .map(|(path, _)| path)
            .collect();
        Ok(Box::new(paths.into_iter()))
    }

    fn enumerate_items(
        &self,
        root: &VfsPath,
        recursive: bool,
        predicate: Option<&dyn Fn(&FsItem) -> bool>,
    ) -> Result<Items> {
        check_absolute(root)?;
        let tree = self.tree();
        let start = if root.is_root() {
            &*tree
        } else {
            match find(&tree, root) {
                Some(Node::Dir(dir)) => dir,
                _ => return Err(FsError::directory_not_found(root)),
            }
        };
        let mut items = Vec::new();
        collect_items(start, root, recursive, &mut items);
        if let Some(predicate) = predicate {
            items.retain(|item| predicate(item));
        }
        Ok(Box::new(items.into_iter()))
    }

    fn can_watch(&self, _path: &VfsPath) -> bool {
        true
    }

    fn watch(&self, path: &VfsPath) -> Result<Arc<dyn Watcher>> {
        check_absolute(path)?;
        let core = Arc::new(WatcherCore::new(self.as_dyn(), path.clone()));
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&core));
        let watcher: Arc<dyn Watcher> = core;
        Ok(watcher)
    }

    fn to_host_path(&self, path: &VfsPath) -> Result<PathBuf> {
        check_absolute(path)?;
        Ok(PathBuf::from(path.as_str()))
    }

    fn from_host_path(&self, path: &Path) -> Result<VfsPath> {
        let Some(s) = path.to_str() else {
            return Err(FsError::invalid_argument(format!(
                "host path {path:?} is not valid UTF-8"
            )));
        };
        Ok(VfsPath::new(s))
    }
}

impl MemoryFileSystem {
    /// Collect `(path, is_dir)` pairs under `root`, in tree order.
    fn collect_entries(&self, root: &VfsPath, recursive: bool) -> Result<Vec<(VfsPath, bool)>> {
        check_absolute(root)?;
        let tree = self.tree();
        let start = if root.is_root() {
            &*tree
        } else {
            match find(&tree, root) {
                Some(Node::Dir(dir)) => dir,
                _ => return Err(FsError::directory_not_found(root)),
            }
        };
        let mut out = Vec::new();
        collect_paths(start, root, recursive, &mut out);
        Ok(out)
    }
}

fn collect_paths(dir: &DirNode, base: &VfsPath, recursive: bool, out: &mut Vec<(VfsPath, bool)>) {
    for (name, node) in &dir.children {
        let path = base.join(name);
        out.push((path.clone(), node.is_dir()));
        if recursive && let Node::Dir(child) = node {
            collect_paths(child, &path, recursive, out);
        }
    }
}

fn collect_items(dir: &DirNode, base: &VfsPath, recursive: bool, out: &mut Vec<FsItem>) {
    for (name, node) in &dir.children {
        let path = base.join(name);
        let meta = node.meta();
        let length = match node {
            Node::File(file) => file
                .data
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len() as u64,
            Node::Dir(_) => 0,
        };
        out.push(FsItem {
            path: path.clone(),
            is_directory: node.is_dir(),
            length,
            attributes: meta.attributes,
            creation_time: meta.creation,
            last_access_time: meta.last_access,
            last_write_time: meta.last_write,
        });
        if recursive && let Node::Dir(child) = node {
            collect_items(child, &path, recursive, out);
        }
    }
}

/// An open handle on an in-memory file. Writes land in the shared buffer;
/// the write timestamp and `Changed` event fire on flush or drop.
struct MemFile {
    fs: Arc<MemoryFileSystem>,
    path: VfsPath,
    data: Arc<RwLock<Vec<u8>>>,
    position: u64,
    readable: bool,
    writable: bool,
    append: bool,
    dirty: bool,
}

impl Read for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.readable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for reading",
            ));
        }
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let start = (self.position as usize).min(data.len());
        let n = (data.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            ));
        }
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if self.append {
            self.position = data.len() as u64;
        }
        let start = self.position as usize;
        if start > data.len() {
            // Seeking past the end zero-fills, like a sparse file.
            data.resize(start, 0);
        }
        let overlap = (data.len() - start).min(buf.len());
        data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        data.extend_from_slice(&buf[overlap..]);
        self.position += buf.len() as u64;
        self.dirty = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.fs.file_written(&self.path);
            self.dirty = false;
        }
        Ok(())
    }
}

impl Seek for MemFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.read().unwrap_or_else(PoisonError::into_inner).len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => len + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        if self.dirty {
            self.fs.file_written(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileSystemExt;
    use crate::watcher::WatchEvent;

    fn p(s: &str) -> VfsPath {
        VfsPath::new(s)
    }

    #[test]
    fn test_write_and_read_back() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/a.txt"), b"hello").unwrap();
        assert!(fs.file_exists(&p("/a.txt")).unwrap());
        assert_eq!(fs.read_to_string(&p("/a.txt")).unwrap(), "hello");
        assert_eq!(fs.file_length(&p("/a.txt")).unwrap(), 5);
    }

    #[test]
    fn test_directories() {
        let fs = MemoryFileSystem::new();
        fs.create_directory(&p("/a")).unwrap();
        fs.create_directory(&p("/a/b")).unwrap();
        assert!(fs.directory_exists(&p("/a/b")).unwrap());
        assert!(!fs.directory_exists(&p("/c")).unwrap());
        // Parent must exist
        assert!(fs.create_directory(&p("/x/y")).is_err());
        // Root always exists and cannot be deleted
        assert!(fs.directory_exists(&p("/")).unwrap());
        assert!(matches!(
            fs.delete_directory(&p("/"), true),
            Err(FsError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_open_modes() {
        let fs = MemoryFileSystem::new();
        assert!(matches!(
            fs.open_file(&p("/f"), OpenMode::Open, FileAccess::READ, FileShare::READ),
            Err(FsError::NotFound { .. })
        ));
        fs.write_bytes(&p("/f"), b"data").unwrap();
        assert!(matches!(
            fs.open_file(
                &p("/f"),
                OpenMode::CreateNew,
                FileAccess::WRITE,
                FileShare::empty()
            ),
            Err(FsError::Exists { .. })
        ));
        // Truncate clears the existing contents
        let file = fs
            .open_file(
                &p("/f"),
                OpenMode::Truncate,
                FileAccess::WRITE,
                FileShare::empty(),
            )
            .unwrap();
        drop(file);
        assert_eq!(fs.file_length(&p("/f")).unwrap(), 0);
    }

    #[test]
    fn test_append_positions_at_end() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/log"), b"one").unwrap();
        let mut file = fs
            .open_file(
                &p("/log"),
                OpenMode::Append,
                FileAccess::WRITE,
                FileShare::empty(),
            )
            .unwrap();
        file.write_all(b"two").unwrap();
        drop(file);
        assert_eq!(fs.read_to_string(&p("/log")).unwrap(), "onetwo");
    }

    #[test]
    fn test_read_only_attribute_blocks_writes() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/f"), b"x").unwrap();
        fs.set_attributes(&p("/f"), FileAttributes::READ_ONLY).unwrap();
        assert!(matches!(
            fs.open_file(
                &p("/f"),
                OpenMode::Open,
                FileAccess::WRITE,
                FileShare::empty()
            ),
            Err(FsError::Unauthorized { .. })
        ));
        assert!(matches!(
            fs.delete_file(&p("/f")),
            Err(FsError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_move_file_requires_fresh_destination() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/a"), b"1").unwrap();
        fs.write_bytes(&p("/b"), b"2").unwrap();
        assert!(matches!(
            fs.move_file(&p("/a"), &p("/b")),
            Err(FsError::Exists { .. })
        ));
        fs.move_file(&p("/a"), &p("/c")).unwrap();
        assert!(!fs.file_exists(&p("/a")).unwrap());
        assert_eq!(fs.read_to_string(&p("/c")).unwrap(), "1");
    }

    #[test]
    fn test_replace_file_with_backup() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/new"), b"new").unwrap();
        fs.write_bytes(&p("/cur"), b"old").unwrap();
        fs.replace_file(&p("/new"), &p("/cur"), Some(&p("/bak")), false)
            .unwrap();
        assert!(!fs.file_exists(&p("/new")).unwrap());
        assert_eq!(fs.read_to_string(&p("/cur")).unwrap(), "new");
        assert_eq!(fs.read_to_string(&p("/bak")).unwrap(), "old");
    }

    #[test]
    fn test_enumerate_paths() {
        let fs = MemoryFileSystem::new();
        fs.create_dir_all(&p("/src/deep")).unwrap();
        fs.write_bytes(&p("/src/a.rs"), b"").unwrap();
        fs.write_bytes(&p("/src/deep/b.rs"), b"").unwrap();
        fs.write_bytes(&p("/src/c.txt"), b"").unwrap();

        let all: Vec<_> = fs
            .enumerate_paths(&p("/src"), "*", true, SearchTarget::Both)
            .unwrap()
            .collect();
        assert_eq!(
            all,
            vec![p("/src/a.rs"), p("/src/c.txt"), p("/src/deep"), p("/src/deep/b.rs")]
        );

        let rs_files: Vec<_> = fs
            .enumerate_paths(&p("/src"), "*.rs", true, SearchTarget::File)
            .unwrap()
            .collect();
        assert_eq!(rs_files, vec![p("/src/a.rs"), p("/src/deep/b.rs")]);

        let one_level: Vec<_> = fs
            .enumerate_paths(&p("/src"), "*", false, SearchTarget::Directory)
            .unwrap()
            .collect();
        assert_eq!(one_level, vec![p("/src/deep")]);

        assert!(matches!(
            fs.enumerate_paths(&p("/nope"), "*", false, SearchTarget::Both),
            Err(FsError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_enumerate_items_predicate() {
        let fs = MemoryFileSystem::new();
        fs.write_bytes(&p("/small"), b"x").unwrap();
        fs.write_bytes(&p("/large"), b"xxxxxxxxxx").unwrap();
        let big_only: Vec<_> = fs
            .enumerate_items(&p("/"), false, Some(&|item: &FsItem| item.length > 5))
            .unwrap()
            .collect();
        assert_eq!(big_only.len(), 1);
        assert_eq!(big_only[0].path, p("/large"));
    }

    #[test]
    fn test_watch_reports_changes() {
        let fs = MemoryFileSystem::new();
        let watcher = fs.watch(&p("/")).unwrap();
        let rx = watcher.core().subscribe();

        fs.write_bytes(&p("/a"), b"1").unwrap();
        fs.delete_file(&p("/a")).unwrap();

        let kinds: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                WatchEvent::Change(c) => Some((c.kind, c.path)),
                _ => None,
            })
            .collect();
        // Created by open, Changed by the flushed write, Deleted at the end.
        assert_eq!(kinds[0], (ChangeKind::Created, p("/a")));
        assert!(kinds.contains(&(ChangeKind::Changed, p("/a"))));
        assert_eq!(kinds.last().unwrap(), &(ChangeKind::Deleted, p("/a")));
    }

    #[test]
    fn test_dropped_watcher_stops_receiving() {
        let fs = MemoryFileSystem::new();
        let watcher = fs.watch(&p("/")).unwrap();
        let rx = watcher.core().subscribe();
        drop(watcher);
        fs.write_bytes(&p("/a"), b"1").unwrap();
        assert!(rx.try_recv().is_err());
    }
}
