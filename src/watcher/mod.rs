mod aggregate;
mod filter;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;

pub use aggregate::{AggregateWatcher, PathConverter, WrapWatcher};
pub use filter::WatchFilter;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::path::VfsPath;

/// The kind of change reported by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

bitflags! {
    /// Which aspects of an entry a watcher is interested in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotifyFilters: u32 {
        const FILE_NAME = 0x001;
        const DIR_NAME = 0x002;
        const ATTRIBUTES = 0x004;
        const SIZE = 0x008;
        const LAST_WRITE = 0x010;
        const LAST_ACCESS = 0x020;
        const CREATION_TIME = 0x040;
        const SECURITY = 0x100;
    }
}

impl Default for NotifyFilters {
    fn default() -> Self {
        NotifyFilters::FILE_NAME
            | NotifyFilters::DIR_NAME
            | NotifyFilters::LAST_WRITE
            | NotifyFilters::SIZE
    }
}

/// A change observed somewhere in a filesystem. `old_path` is set for
/// renames only.
#[derive(Clone)]
pub struct ChangeEvent {
    /// The filesystem the event is reported for: the one the watcher was
    /// obtained from, not the leaf that observed the change.
    pub filesystem: Arc<dyn FileSystem>,
    pub kind: ChangeKind,
    pub path: VfsPath,
    pub old_path: Option<VfsPath>,
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("old_path", &self.old_path)
            .finish_non_exhaustive()
    }
}

/// An event delivered to watcher subscribers: a change, or an error raised
/// by the underlying watch machinery.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Change(ChangeEvent),
    Error(String),
}

/// A registered event callback.
pub type EventHandler = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// The basic watcher: filter configuration plus subscriber fan-out.
///
/// Every watcher in the crate (leaf, wrapping, aggregating) carries one of
/// these and raises events through it.
/// An event is delivered when the composite gate passes:
/// `enabled && filter(name) && path-in-watch-root`.
pub struct WatcherCore {
    filesystem: Arc<dyn FileSystem>,
    root: VfsPath,
    filter: Mutex<WatchFilter>,
    notify_filters: Mutex<NotifyFilters>,
    enabled: AtomicBool,
    include_subdirectories: AtomicBool,
    handlers: Mutex<Vec<EventHandler>>,
}

impl WatcherCore {
    pub fn new(filesystem: Arc<dyn FileSystem>, root: VfsPath) -> Self {
        WatcherCore {
            filesystem,
            root,
            filter: Mutex::new(WatchFilter::default()),
            notify_filters: Mutex::new(NotifyFilters::default()),
            enabled: AtomicBool::new(true),
            include_subdirectories: AtomicBool::new(true),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// The filesystem this watcher reports events for.
    pub fn filesystem(&self) -> &Arc<dyn FileSystem> {
        &self.filesystem
    }

    /// The watched path.
    pub fn path(&self) -> &VfsPath {
        &self.root
    }

    pub fn filter(&self) -> String {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pattern()
            .to_string()
    }

    /// Set the name filter glob. Compiled once here; empty coerces to `*`.
    pub fn set_filter(&self, pattern: &str) -> Result<()> {
        let filter = WatchFilter::new(pattern)?;
        *self.filter.lock().unwrap_or_else(PoisonError::into_inner) = filter;
        Ok(())
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn include_subdirectories(&self) -> bool {
        self.include_subdirectories.load(Ordering::Relaxed)
    }

    pub fn set_include_subdirectories(&self, include: bool) {
        self.include_subdirectories.store(include, Ordering::Relaxed);
    }

    pub fn notify_filters(&self) -> NotifyFilters {
        *self
            .notify_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_notify_filters(&self, filters: NotifyFilters) {
        *self
            .notify_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = filters;
    }

    /// Register a callback invoked for every delivered event.
    pub fn on_event(&self, handler: impl Fn(&WatchEvent) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Channel-style subscription: events are cloned into the returned
    /// receiver.
    pub fn subscribe(&self) -> Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel();
        self.on_event(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Raise a change event, applying the composite gate.
    pub fn raise(&self, kind: ChangeKind, path: VfsPath, old_path: Option<VfsPath>) {
        if !self.should_raise(&path) {
            return;
        }
        let event = WatchEvent::Change(ChangeEvent {
            filesystem: self.filesystem.clone(),
            kind,
            path,
            old_path,
        });
        self.dispatch(&event);
    }

    /// Raise an error event. Errors bypass the filter and root checks but
    /// still honor `enabled`.
    pub fn raise_error(&self, message: impl Into<String>) {
        if !self.enabled() {
            return;
        }
        self.dispatch(&WatchEvent::Error(message.into()));
    }

    fn should_raise(&self, path: &VfsPath) -> bool {
        if !self.enabled() {
            return false;
        }
        if !path.is_in_directory(&self.root, self.include_subdirectories()) {
            return false;
        }
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .matches(path.file_name())
    }

    fn dispatch(&self, event: &WatchEvent) {
        // Snapshot the handler list so callbacks can register further
        // handlers without deadlocking.
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(event);
        }
    }
}

impl fmt::Debug for WatcherCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherCore")
            .field("root", &self.root)
            .field("enabled", &self.enabled())
            .finish_non_exhaustive()
    }
}

/// The uniform watcher surface handed out by `FileSystem::watch`.
pub trait Watcher: Send + Sync {
    fn core(&self) -> &WatcherCore;
}

impl Watcher for WatcherCore {
    fn core(&self) -> &WatcherCore {
        self
    }
}
