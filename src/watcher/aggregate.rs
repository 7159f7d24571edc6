use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::{WatchEvent, Watcher, WatcherCore};
use crate::fs::{FileSystem, same_filesystem};
use crate::path::VfsPath;

/// Rewrites an event path from a child watcher's namespace into the
/// composed namespace. Returning `None` drops the event.
pub type PathConverter = Arc<dyn Fn(&VfsPath) -> Option<VfsPath> + Send + Sync>;

/// Forwards events from another watcher, optionally translating paths.
///
/// Used wherever a composer exposes a child filesystem's watcher under a
/// different namespace: the Mount composer prepends mount prefixes, the Sub
/// composer strips its subpath. Events whose path does not translate are
/// dropped; renames additionally require the old path to translate.
pub struct WrapWatcher {
    core: WatcherCore,
    convert: Option<PathConverter>,
    // Keeps the forwarded watcher alive for as long as the wrapper is.
    _source: Arc<dyn Watcher>,
}

impl WrapWatcher {
    pub fn new(
        filesystem: Arc<dyn FileSystem>,
        root: VfsPath,
        source: Arc<dyn Watcher>,
        convert: Option<PathConverter>,
    ) -> Arc<Self> {
        let wrap = Arc::new(WrapWatcher {
            core: WatcherCore::new(filesystem, root),
            convert,
            _source: source.clone(),
        });
        let weak = Arc::downgrade(&wrap);
        source.core().on_event(move |event| {
            if let Some(wrap) = weak.upgrade() {
                wrap.forward(event);
            }
        });
        wrap
    }

    fn convert_path(&self, path: &VfsPath) -> Option<VfsPath> {
        match &self.convert {
            None => Some(path.clone()),
            Some(convert) => convert(path),
        }
    }

    fn forward(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Change(change) => {
                let Some(path) = self.convert_path(&change.path) else {
                    return;
                };
                let old_path = match &change.old_path {
                    Some(old) => match self.convert_path(old) {
                        Some(old) => Some(old),
                        // A rename where only one side translates is
                        // meaningless in this namespace.
                        None => return,
                    },
                    None => None,
                };
                self.core.raise(change.kind, path, old_path);
            }
            WatchEvent::Error(message) => self.core.raise_error(message.clone()),
        }
    }
}

impl Watcher for WrapWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }
}

/// Multiplexes many child watchers into one subscription.
///
/// Composers hand these out and splice children in and out as their
/// structure changes: an event on any attached child re-raises through this
/// watcher's own gate, exactly once per subscriber.
pub struct AggregateWatcher {
    this: Weak<AggregateWatcher>,
    core: WatcherCore,
    children: Mutex<Vec<Arc<dyn Watcher>>>,
}

impl AggregateWatcher {
    pub fn new(filesystem: Arc<dyn FileSystem>, root: VfsPath) -> Arc<Self> {
        Arc::new_cyclic(|this| AggregateWatcher {
            this: this.clone(),
            core: WatcherCore::new(filesystem, root),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Attach a child watcher. Its events propagate until it is detached.
    pub fn add(&self, child: Arc<dyn Watcher>) {
        let weak = self.this.clone();
        // Identify the child by its core address so a detached child whose
        // Arc still lives elsewhere stops propagating.
        let key = child.core() as *const WatcherCore as usize;
        child.core().on_event(move |event| {
            if let Some(agg) = weak.upgrade()
                && agg.contains(key)
            {
                agg.forward(event);
            }
        });
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(child);
    }

    /// Detach every child whose underlying filesystem is `filesystem`.
    pub fn remove_from(&self, filesystem: &Arc<dyn FileSystem>) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|child| !same_filesystem(child.core().filesystem(), filesystem));
    }

    /// Detach all children.
    pub fn clear(&self) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn child_count(&self) -> usize {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn contains(&self, key: usize) -> bool {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|child| child.core() as *const WatcherCore as usize == key)
    }

    fn forward(&self, event: &WatchEvent) {
        match event {
            WatchEvent::Change(change) => {
                self.core
                    .raise(change.kind, change.path.clone(), change.old_path.clone());
            }
            WatchEvent::Error(message) => self.core.raise_error(message.clone()),
        }
    }
}

impl Watcher for AggregateWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::MemoryFileSystem;
    use crate::watcher::ChangeKind;

    #[test]
    fn test_wrap_translates_paths() {
        let fs: Arc<dyn FileSystem> = MemoryFileSystem::new();
        let source = Arc::new(WatcherCore::new(fs.clone(), VfsPath::root()));
        let prefix = VfsPath::new("/mnt");
        let convert: PathConverter =
            Arc::new(move |p: &VfsPath| Some(prefix.join(p.to_relative().as_str())));
        let wrap = WrapWatcher::new(fs, VfsPath::root(), source.clone(), Some(convert));
        let rx = wrap.core().subscribe();

        source.raise(ChangeKind::Created, VfsPath::new("/a.txt"), None);
        match rx.try_recv().unwrap() {
            WatchEvent::Change(c) => assert_eq!(c.path, VfsPath::new("/mnt/a.txt")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_wrap_drops_untranslatable_rename() {
        let fs: Arc<dyn FileSystem> = MemoryFileSystem::new();
        let source = Arc::new(WatcherCore::new(fs.clone(), VfsPath::root()));
        // Only paths under /keep translate.
        let convert: PathConverter = Arc::new(|p: &VfsPath| {
            p.is_in_directory(&VfsPath::new("/keep"), true)
                .then(|| p.clone())
        });
        let wrap = WrapWatcher::new(fs, VfsPath::root(), source.clone(), Some(convert));
        let rx = wrap.core().subscribe();

        source.raise(
            ChangeKind::Renamed,
            VfsPath::new("/keep/new"),
            Some(VfsPath::new("/outside/old")),
        );
        assert!(rx.try_recv().is_err());

        source.raise(
            ChangeKind::Renamed,
            VfsPath::new("/keep/new"),
            Some(VfsPath::new("/keep/old")),
        );
        assert!(matches!(rx.try_recv(), Ok(WatchEvent::Change(_))));
    }

    #[test]
    fn test_aggregate_fan_in_and_remove() {
        let fs_a: Arc<dyn FileSystem> = MemoryFileSystem::new();
        let fs_b: Arc<dyn FileSystem> = MemoryFileSystem::new();
        let child_a = Arc::new(WatcherCore::new(fs_a.clone(), VfsPath::root()));
        let child_b = Arc::new(WatcherCore::new(fs_b.clone(), VfsPath::root()));

        let agg = AggregateWatcher::new(MemoryFileSystem::new(), VfsPath::root());
        agg.add(child_a.clone());
        agg.add(child_b.clone());
        assert_eq!(agg.child_count(), 2);

        let rx = agg.core().subscribe();
        child_a.raise(ChangeKind::Created, VfsPath::new("/x"), None);
        child_b.raise(ChangeKind::Created, VfsPath::new("/y"), None);
        let got: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                WatchEvent::Change(c) => Some(c.path),
                _ => None,
            })
            .collect();
        assert_eq!(got, vec![VfsPath::new("/x"), VfsPath::new("/y")]);

        agg.remove_from(&fs_a);
        assert_eq!(agg.child_count(), 1);
        child_a.raise(ChangeKind::Created, VfsPath::new("/z"), None);
        assert!(rx.try_recv().is_err());
    }
}
