//! Tree node types.
//!
//! A node is either a folder or a file. Folders own children by reference
//! (`parent_id` on the child); files carry an opaque byte payload. There is
//! no stored absolute path anywhere: a path is derived from the parent chain.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::ids::NodeId;

/// Node kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum NodeKind {
    /// A folder (may have children, never has content).
    #[strum(serialize = "folder", serialize = "dir", serialize = "directory")]
    Folder,
    /// A file (has content, never has children).
    File,
}

impl NodeKind {
    /// Parse from string (case-insensitive).
    ///
    /// Supports aliases: "dir"/"directory" -> Folder.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to the stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::File => "file",
        }
    }

    /// Returns true if this is a folder.
    pub fn is_folder(&self) -> bool {
        matches!(self, NodeKind::Folder)
    }

    /// Returns true if this is a file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A full node row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Name within the parent folder. Empty only for the root.
    pub name: String,
    pub kind: NodeKind,
    /// `None` only for the root.
    pub parent_id: Option<NodeId>,
    /// Present iff `kind == File`.
    pub content: Option<Vec<u8>>,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds.
    pub updated_at: u64,
}

impl Node {
    /// A new folder under `parent`, stamped with the current time.
    pub fn folder(parent: NodeId, name: impl Into<String>) -> Self {
        Self::with_kind(Some(parent), name.into(), NodeKind::Folder, None)
    }

    /// A new file under `parent`, stamped with the current time.
    pub fn file(parent: NodeId, name: impl Into<String>, content: Vec<u8>) -> Self {
        Self::with_kind(Some(parent), name.into(), NodeKind::File, Some(content))
    }

    /// The root folder. Created once, at bootstrap.
    pub fn root() -> Self {
        Self::with_kind(None, String::new(), NodeKind::Folder, None)
    }

    fn with_kind(
        parent_id: Option<NodeId>,
        name: String,
        kind: NodeKind,
        content: Option<Vec<u8>>,
    ) -> Self {
        let now = crate::now_millis();
        Self {
            id: NodeId::new(),
            name,
            kind,
            parent_id,
            content,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_folder(&self) -> bool {
        self.kind.is_folder()
    }

    /// The listing view of this node.
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
        }
    }
}

/// Listing entry: what `ls` returns and what the children cache holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

impl NodeSummary {
    pub fn is_folder(&self) -> bool {
        self.kind.is_folder()
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }
}

/// Node metadata with a computed size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub summary: NodeSummary,
    pub parent_id: Option<NodeId>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Content length for a file; total content length of every file in the
    /// subtree for a folder.
    pub size: u64,
}
