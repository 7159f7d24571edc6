use std::time::SystemTime;

use bitflags::bitflags;
use globset::{Glob, GlobMatcher};

use crate::error::{FsError, Result};
use crate::path::VfsPath;

/// How `open_file` treats an existing (or missing) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open an existing file; fail if it does not exist.
    Open,
    /// Open an existing file or create it.
    OpenOrCreate,
    /// Create the file, truncating it if it exists.
    Create,
    /// Create the file; fail if it already exists.
    CreateNew,
    /// Open an existing file and truncate it.
    Truncate,
    /// Open or create, positioned at the end.
    Append,
}

bitflags! {
    /// Requested access on an opened file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAccess: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = 0b11;
    }
}

bitflags! {
    /// Advisory sharing for an opened file. Leaves may ignore it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileShare: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const DELETE = 0b100;
    }
}

bitflags! {
    /// Attribute bits carried by files and directories.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const NORMAL = 0x80;
    }
}

/// What kind of entries an enumeration yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchTarget {
    File,
    Directory,
    Both,
}

impl SearchTarget {
    pub fn accepts(self, is_directory: bool) -> bool {
        match self {
            SearchTarget::File => !is_directory,
            SearchTarget::Directory => is_directory,
            SearchTarget::Both => true,
        }
    }
}

/// A compiled search pattern, matched against the leaf name segment of each
/// candidate entry.
///
/// `*` and the legacy `*.*` spelling match everything; an empty pattern is
/// coerced to `*`. Anything else compiles as a glob.
#[derive(Debug, Clone)]
pub struct SearchPattern {
    raw: String,
    matcher: Option<GlobMatcher>,
}

impl SearchPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let raw = if pattern.is_empty() { "*" } else { pattern };
        let matcher = if raw == "*" || raw == "*.*" {
            None
        } else {
            let glob = Glob::new(raw).map_err(|e| {
                FsError::invalid_argument(format!("bad search pattern {raw:?}: {e}"))
            })?;
            Some(glob.compile_matcher())
        };
        Ok(SearchPattern {
            raw: raw.to_string(),
            matcher,
        })
    }

    /// The pattern that everything matches.
    pub fn match_all() -> Self {
        SearchPattern {
            raw: "*".to_string(),
            matcher: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            None => true,
            Some(m) => m.is_match(name),
        }
    }
}

/// A single enumerated entry with its metadata, as produced by
/// `enumerate_items`.
#[derive(Debug, Clone)]
pub struct FsItem {
    pub path: VfsPath,
    pub is_directory: bool,
    pub length: u64,
    pub attributes: FileAttributes,
    pub creation_time: SystemTime,
    pub last_access_time: SystemTime,
    pub last_write_time: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_match_all_spellings() {
        for p in ["*", "*.*", ""] {
            let pat = SearchPattern::new(p).unwrap();
            assert!(pat.matches("file.txt"));
            assert!(pat.matches("noext"));
        }
    }

    #[test]
    fn test_pattern_glob() {
        let pat = SearchPattern::new("*.txt").unwrap();
        assert!(pat.matches("a.txt"));
        assert!(!pat.matches("a.rs"));

        let pat = SearchPattern::new("data?").unwrap();
        assert!(pat.matches("data1"));
        assert!(!pat.matches("data12"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        assert!(SearchPattern::new("[").is_err());
    }

    #[test]
    fn test_search_target() {
        assert!(SearchTarget::File.accepts(false));
        assert!(!SearchTarget::File.accepts(true));
        assert!(SearchTarget::Directory.accepts(true));
        assert!(SearchTarget::Both.accepts(true));
        assert!(SearchTarget::Both.accepts(false));
    }
}
