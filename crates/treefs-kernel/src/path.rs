//! Tree paths.
//!
//! Paths are never stored. A [`NodePath`] is the normalized, root-relative
//! sequence of names used to address a node; the store only knows
//! `(parent_id, name)` pairs.
//!
//! Normalization mirrors `Path::components` handling in the memory VFS:
//! repeated `/` collapse, `.` is dropped, `..` pops one segment and never
//! climbs above the root, a trailing `/` is ignored.

use std::fmt;

use crate::error::{TreeError, TreeResult};

/// Maximum length of a single name, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum length of a raw path, in bytes.
pub const MAX_PATH_LEN: usize = 500;

/// Path separator.
pub const SEPARATOR: char = '/';

/// Check that `name` can be stored as a node name.
pub fn validate_name(name: &str) -> TreeResult<()> {
    if name.is_empty() {
        return Err(TreeError::invalid("name must not be empty"));
    }
    if name == "." || name == ".." {
        return Err(TreeError::invalid(format!("reserved name: {name}")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TreeError::invalid(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains(SEPARATOR) {
        return Err(TreeError::invalid(format!("name contains '/': {name}")));
    }
    if name.chars().any(char::is_control) {
        return Err(TreeError::invalid(format!(
            "name contains control characters: {name:?}"
        )));
    }
    Ok(())
}

/// A normalized absolute path. The empty segment list is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse and normalize a root-relative path.
    ///
    /// A missing leading `/` is tolerated: `docs/work` and `/docs/work` are
    /// the same path. `""` and `/` are the root.
    pub fn parse(raw: &str) -> TreeResult<Self> {
        let rel = RelativePath::parse(raw)?;
        Ok(Self {
            segments: rel.segments,
        })
    }

    /// Build from already-validated segments.
    pub(crate) fn from_segments(segments: Vec<String>) -> Self {
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments (0 for the root).
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, `None` for the root.
    pub fn file_name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path. The root is its own parent.
    pub fn parent(&self) -> NodePath {
        let mut segments = self.segments.clone();
        segments.pop();
        Self { segments }
    }

    /// Append a validated name.
    pub fn join(&self, name: &str) -> TreeResult<NodePath> {
        validate_name(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// True if `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &NodePath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    /// Resolve a relative path against this one, lexically.
    pub fn resolve(&self, rel: &RelativePath) -> NodePath {
        if rel.absolute {
            return Self::from_segments(rel.segments.clone());
        }
        let keep = self.segments.len().saturating_sub(rel.ups);
        let mut segments: Vec<String> = self.segments[..keep].to_vec();
        segments.extend(rel.segments.iter().cloned());
        Self { segments }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for NodePath {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A path that may be relative to some base folder.
///
/// `x/..` pairs are collapsed lexically; `..` segments that cannot be
/// collapsed are kept as a count of leading parent steps. For an absolute
/// path leading `..` are dropped, since the root is its own parent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelativePath {
    pub absolute: bool,
    pub ups: usize,
    pub segments: Vec<String>,
}

impl RelativePath {
    pub fn parse(raw: &str) -> TreeResult<Self> {
        if raw.len() > MAX_PATH_LEN {
            return Err(TreeError::invalid(format!(
                "path longer than {MAX_PATH_LEN} bytes"
            )));
        }
        let absolute = raw.starts_with(SEPARATOR);
        let mut ups = 0usize;
        let mut segments: Vec<String> = Vec::new();
        for part in raw.split(SEPARATOR) {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() && !absolute {
                        ups += 1;
                    }
                }
                name => {
                    validate_name(name)?;
                    segments.push(name.to_string());
                }
            }
        }
        Ok(Self {
            absolute,
            ups,
            segments,
        })
    }

    /// True for `""`, `.` and friends: stays where it is.
    pub fn is_current(&self) -> bool {
        !self.absolute && self.ups == 0 && self.segments.is_empty()
    }
}
