use std::io;

use thiserror::Error;

use crate::path::VfsPath;

/// Crate-wide result alias.
pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// Errors surfaced by filesystems and composers.
///
/// Leaf I/O errors propagate verbatim through [`FsError::Io`]; composers add
/// their own kinds for routing and guard failures but never retry or
/// suppress.
#[derive(Debug, Error)]
pub enum FsError {
    /// A file or directory does not exist where a concrete resolution was
    /// required.
    #[error("path not found: {path}")]
    NotFound { path: VfsPath },

    /// Directory-operation specialization of `NotFound`, kept distinct for
    /// enumeration error reporting.
    #[error("directory not found: {path}")]
    DirectoryNotFound { path: VfsPath },

    /// Write attempts on a readonly view, moves or deletes of a mount root.
    #[error("access denied: {reason}")]
    Unauthorized { reason: String },

    /// Cross-mount directory moves, multi-mount file replacement.
    #[error("not supported: {reason}")]
    NotSupported { reason: String },

    /// Guarded writes on an aggregate view.
    #[error("filesystem is read-only: {path}")]
    ReadOnly { path: VfsPath },

    /// A move or copy destination already exists.
    #[error("destination already exists: {path}")]
    Exists { path: VfsPath },

    /// Self-registration, duplicate registration, a null path where
    /// forbidden, or an ill-formed mount prefix.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A delegate returned a path outside the subtree it was given: a
    /// contract violation, not a user error.
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    /// An I/O error from a leaf filesystem, passed through unchanged.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FsError {
    pub fn not_found(path: &VfsPath) -> Self {
        FsError::NotFound { path: path.clone() }
    }

    pub fn directory_not_found(path: &VfsPath) -> Self {
        FsError::DirectoryNotFound { path: path.clone() }
    }

    pub fn read_only(path: &VfsPath) -> Self {
        FsError::ReadOnly { path: path.clone() }
    }

    pub fn exists(path: &VfsPath) -> Self {
        FsError::Exists { path: path.clone() }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        FsError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn not_supported(reason: impl Into<String>) -> Self {
        FsError::NotSupported {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        FsError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        FsError::InvalidState {
            reason: reason.into(),
        }
    }

    /// Whether this error means "nothing at that path", regardless of the
    /// file/directory flavor.
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound { .. } | FsError::DirectoryNotFound { .. } => true,
            FsError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
