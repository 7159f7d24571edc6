pub mod aggregate;
pub mod mount;
pub mod sub;

pub use aggregate::AggregateFileSystem;
pub use mount::MountFileSystem;
pub use sub::SubFileSystem;

use std::sync::Arc;

use crate::error::Result;
use crate::fs::FileSystem;
use crate::path::VfsPath;
use crate::watcher::PathConverter;

/// The base contract for composers that wrap exactly one inner filesystem.
///
/// Implementors provide the inner filesystem and a pair of path translation
/// hooks; their [`FileSystem`] implementation forwards every operation
/// through them. Watchers handed out by such a composer translate event
/// paths back through the owned converter, dropping events that fall
/// outside the translated namespace.
///
/// [`SubFileSystem`] is the pass-through specialization; the aggregate and
/// mount composers dispatch N-ways instead and implement [`FileSystem`]
/// directly.
pub trait DelegateFileSystem: Send + Sync {
    /// The wrapped filesystem.
    fn delegate(&self) -> &Arc<dyn FileSystem>;

    /// Translate a path of this filesystem into the delegate's namespace.
    fn convert_to_delegate(&self, path: &VfsPath) -> Result<VfsPath>;

    /// Translate a delegate path back. Paths the delegate should never have
    /// produced are a contract violation.
    fn convert_from_delegate(&self, path: &VfsPath) -> Result<VfsPath>;

    /// This composer as a shared handle, stamped on watchers it hands out.
    fn as_filesystem(&self) -> Arc<dyn FileSystem>;

    /// An owned version of [`convert_from_delegate`] for event rewriting;
    /// returning `None` drops the event instead of erroring.
    ///
    /// [`convert_from_delegate`]: DelegateFileSystem::convert_from_delegate
    fn from_delegate_converter(&self) -> PathConverter;
}
