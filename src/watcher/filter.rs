use crate::error::Result;
use crate::fs::SearchPattern;

/// The name filter attached to a watcher.
///
/// Matched against the leaf segment of each event path. The default is the
/// conventional `*.*`, which (like `*`) matches every name; an empty
/// pattern is coerced to `*`. The glob is compiled once when the filter is
/// set.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    pattern: SearchPattern,
}

impl WatchFilter {
    pub fn new(pattern: &str) -> Result<Self> {
        Ok(WatchFilter {
            pattern: SearchPattern::new(pattern)?,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern.matches(name)
    }
}

impl Default for WatchFilter {
    fn default() -> Self {
        // "*.*" is one of the match-all spellings and never fails to parse.
        WatchFilter::new("*.*").expect("default watch filter")
    }
}
