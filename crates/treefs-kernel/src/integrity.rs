//! Tree integrity checker.
//!
//! Scans a full set of node rows and reports every broken tree invariant.
//! The schema already rejects most of these at write time; the checker
//! exists for tests and for inspecting a store that was edited by hand.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;
use treefs_types::{Node, NodeId, NodeKind};

/// One broken invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum Violation {
    /// No row without a parent.
    MissingRoot,
    /// More than one row without a parent.
    MultipleRoots { ids: Vec<NodeId> },
    /// The parentless row is not a folder.
    RootNotFolder { id: NodeId },
    /// Cannot be reached from the root: dangling parent or a parent cycle.
    Unreachable { id: NodeId },
    /// Two children of one folder share a name.
    DuplicateName { parent: NodeId, name: String },
    /// A file is some node's parent.
    FileHasChildren { id: NodeId },
    /// Content present on a folder, or missing on a file.
    ContentMismatch { id: NodeId, kind: NodeKind },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingRoot => write!(f, "no root folder"),
            Violation::MultipleRoots { ids } => write!(f, "{} root nodes", ids.len()),
            Violation::RootNotFolder { id } => write!(f, "root {id} is not a folder"),
            Violation::Unreachable { id } => write!(f, "node {id} is unreachable from the root"),
            Violation::DuplicateName { parent, name } => {
                write!(f, "folder {parent} has more than one child named {name:?}")
            }
            Violation::FileHasChildren { id } => write!(f, "file {id} has children"),
            Violation::ContentMismatch { id, kind } => {
                write!(f, "{kind} {id} has the wrong content presence")
            }
        }
    }
}

/// Check a complete set of rows. An empty result means the tree is healthy.
pub fn check(nodes: &[Node]) -> Vec<Violation> {
    let mut violations = Vec::new();

    let roots: Vec<&Node> = nodes.iter().filter(|n| n.parent_id.is_none()).collect();
    match roots.as_slice() {
        [] => violations.push(Violation::MissingRoot),
        [root] if !root.is_folder() => violations.push(Violation::RootNotFolder { id: root.id }),
        [_] => {}
        many => violations.push(Violation::MultipleRoots {
            ids: many.iter().map(|n| n.id).collect(),
        }),
    }

    let by_id: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut children: HashMap<NodeId, Vec<&Node>> = HashMap::new();
    for node in nodes {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node);
        }
        if node.kind.is_file() != node.content.is_some() {
            violations.push(Violation::ContentMismatch {
                id: node.id,
                kind: node.kind,
            });
        }
    }

    let mut parents: Vec<&NodeId> = children.keys().collect();
    parents.sort();
    for parent in parents {
        let kids = &children[parent];
        if by_id.get(parent).is_some_and(|p| p.kind.is_file()) {
            violations.push(Violation::FileHasChildren { id: *parent });
        }
        let mut names = HashSet::new();
        let mut reported = HashSet::new();
        for kid in kids {
            if !names.insert(kid.name.as_str()) && reported.insert(kid.name.as_str()) {
                violations.push(Violation::DuplicateName {
                    parent: *parent,
                    name: kid.name.clone(),
                });
            }
        }
    }

    let mut reached: HashSet<NodeId> = HashSet::new();
    let mut queue: VecDeque<NodeId> = roots.iter().map(|r| r.id).collect();
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        for kid in children.get(&id).into_iter().flatten() {
            queue.push_back(kid.id);
        }
    }
    let mut unreachable: Vec<NodeId> = nodes
        .iter()
        .map(|n| n.id)
        .filter(|id| !reached.contains(id))
        .collect();
    unreachable.sort();
    violations.extend(unreachable.into_iter().map(|id| Violation::Unreachable { id }));

    violations
}
