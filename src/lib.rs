//! Composable virtual filesystem.
//!
//! Everything, leaf backends and composed views alike, implements the one
//! [`fs::FileSystem`] trait, so filesystems stack transparently:
//!
//! - [`compose::AggregateFileSystem`] merges an ordered stack of filesystems
//!   into a readonly overlay where later entries shadow earlier ones.
//! - [`compose::MountFileSystem`] routes each path to the filesystem with
//!   the longest matching mount prefix, synthesizing parent directories of
//!   mount points.
//! - [`compose::SubFileSystem`] projects a subdirectory of another
//!   filesystem as a new root.
//!
//! Change notification follows the same shape: composers hand out
//! aggregating watchers that splice child watchers in and out as mounts and
//! layers come and go, rewriting event paths into the composed namespace.
//!
//! Two leaf backends ship with the crate: [`fs::memory::MemoryFileSystem`]
//! and [`fs::physical::PhysicalFileSystem`].
//!
//! ```
//! use stackfs::compose::AggregateFileSystem;
//! use stackfs::fs::{FileSystemExt, memory::MemoryFileSystem};
//! use stackfs::path::VfsPath;
//!
//! # fn main() -> stackfs::error::Result<()> {
//! let base = MemoryFileSystem::new();
//! base.write_bytes(&VfsPath::new("/greeting"), b"hello")?;
//! let patch = MemoryFileSystem::new();
//! patch.write_bytes(&VfsPath::new("/greeting"), b"hello, world")?;
//!
//! let overlay = AggregateFileSystem::new();
//! overlay.add_filesystem(base)?;
//! overlay.add_filesystem(patch)?;
//! assert_eq!(overlay.read_to_string(&VfsPath::new("/greeting"))?, "hello, world");
//! # Ok(())
//! # }
//! ```

pub mod compose;
pub mod error;
pub mod fs;
pub mod path;
pub mod watcher;
