//! Path-addressed JSON document storage.
//!
//! The layout mirrors a realtime database: every document lives at a
//! slash-separated path and reading a collection path yields an object of
//! its children keyed by their last segment.

mod fs;
mod memory;

use std::fmt;

use anyhow::anyhow;
use serde_json::Value;

use crate::subscription::Unsubscribe;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

pub type WatchCallback = Box<dyn FnMut(Option<Value>) + Send>;

pub trait DocumentBackend: Send + Sync {
    /// Short label for logs, e.g. the storage root.
    fn describe(&self) -> String;

    fn get(&self, path: &DocPath) -> anyhow::Result<Option<Value>>;

    /// Writes `value` at `path`. `Value::Null` removes the document.
    fn set(&self, path: &DocPath, value: Value) -> anyhow::Result<()>;

    /// Calls `callback` with the current value at `path` and again whenever
    /// it changes, until the returned handle is released.
    fn watch(&self, path: &DocPath, callback: WatchCallback) -> anyhow::Result<Unsubscribe>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new<I, S>(segments: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        for segment in segments {
            path.segments.push(validate_segment(segment.into())?);
        }
        Ok(path)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Self::new(raw.split('/').filter(|segment| !segment.is_empty()))
    }

    pub fn child(&self, segment: impl Into<String>) -> anyhow::Result<Self> {
        let mut path = self.clone();
        path.segments.push(validate_segment(segment.into())?);
        Ok(path)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn starts_with(&self, prefix: &DocPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// True when a write at one path can change the value seen at the other.
    pub fn overlaps(&self, other: &DocPath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

fn validate_segment(segment: String) -> anyhow::Result<String> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(anyhow!("invalid path segment: {segment:?}"));
    }
    if segment.contains(['/', '\\']) || segment.chars().any(char::is_control) {
        return Err(anyhow!("invalid characters in path segment: {segment:?}"));
    }
    Ok(segment)
}

#[cfg(test)]
mod tests {
    use super::DocPath;

    #[test]
    fn parse_and_display() {
        let path = DocPath::parse("/users/u1/days/").expect("path");
        assert_eq!(path.segments(), ["users", "u1", "days"]);
        assert_eq!(path.to_string(), "/users/u1/days");
        assert!(DocPath::parse("").expect("root").is_root());
    }

    #[test]
    fn rejects_traversal() {
        assert!(DocPath::new(["users", ".."]).is_err());
        assert!(DocPath::root().child("a\\b").is_err());
        assert!(DocPath::root().child("").is_err());
    }

    #[test]
    fn overlap_is_prefix_either_way() {
        let days = DocPath::parse("users/u1/days").expect("path");
        let one = days.child("2024-01-01").expect("child");
        let weeks = DocPath::parse("users/u1/weeks").expect("path");
        assert!(days.overlaps(&one));
        assert!(one.overlaps(&days));
        assert!(!weeks.overlaps(&one));
        assert!(DocPath::root().overlaps(&weeks));
    }
}
