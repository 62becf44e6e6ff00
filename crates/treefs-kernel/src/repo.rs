//! Tree repository.
//!
//! The path-addressed operations on the tree. Each one is a single
//! transaction through the [`TxnController`]: mutations resolve against the
//! store, validate everything, lock the rows they touch, write, and queue
//! the cache keys whose answers they changed. Reads resolve through the
//! cache against one snapshot.
//!
//! A move rewrites exactly one row. Children point at their parent by ID,
//! so a subtree of any size follows its root for free, and only the four
//! cache keys around the moved node need invalidating.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use treefs_types::{Node, NodeId, NodeStat, NodeSummary};

use crate::cache::{CacheKey, CacheStats, TreeCache};
use crate::config::TreeConfig;
use crate::db::{NodeDb, NodeRows};
use crate::error::{TreeError, TreeResult};
use crate::integrity::{self, Violation};
use crate::path::{NodePath, validate_name};
use crate::resolver::{Resolved, Resolver};
use crate::txn::{RetryPolicy, Txn, TxnController};

/// One `find` match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub path: NodePath,
    pub node: NodeSummary,
}

/// Shared handle, cheap to clone across tasks.
pub type SharedRepository = Arc<TreeRepository>;

/// The tree.
pub struct TreeRepository {
    ctl: TxnController,
    root: NodeId,
    max_content_bytes: usize,
    find_max_depth: Option<usize>,
}

impl TreeRepository {
    /// Open the repository described by `config`.
    pub fn open(config: &TreeConfig) -> TreeResult<Self> {
        let db = match &config.database {
            Some(path) => NodeDb::open(path, config.busy_timeout())?,
            None => NodeDb::in_memory()?,
        };
        let ctl = TxnController::new(
            db,
            TreeCache::from_config(&config.cache),
            RetryPolicy::from_config(config),
        );
        let root = ctl.read("root", |rows, _| Resolver::store(rows).root())?.id;
        Ok(Self {
            ctl,
            root,
            max_content_bytes: config.max_content_bytes,
            find_max_depth: config.find_max_depth,
        })
    }

    /// A private in-memory tree with default settings.
    pub fn in_memory() -> TreeResult<Self> {
        Self::open(&TreeConfig::default())
    }

    pub fn root_id(&self) -> NodeId {
        self.root
    }

    pub fn controller(&self) -> &TxnController {
        &self.ctl
    }

    /// Resolution cache counters, if the cache store keeps them.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.ctl.cache().stats()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Resolve a path to its node.
    pub fn resolve(&self, path: &NodePath) -> TreeResult<NodeSummary> {
        self.read_with("resolve", |r| Ok(r.resolve(path)?.node))
    }

    /// Resolve a path that must be a folder. Used by `cd`.
    pub fn resolve_folder(&self, path: &NodePath) -> TreeResult<NodeId> {
        self.read_with("cd", |r| Ok(r.resolve_folder(path)?.node.id))
    }

    /// Current absolute path of a node.
    pub fn path_of(&self, id: NodeId) -> TreeResult<NodePath> {
        self.read_with("path_of", |r| r.path_of(id))
    }

    /// Content of a file.
    pub fn read(&self, path: &NodePath) -> TreeResult<Vec<u8>> {
        self.ctl.read("read", |rows, epoch| {
            let resolved = Resolver::cached(rows, self.ctl.cache(), epoch).resolve(path)?;
            if resolved.node.is_folder() {
                return Err(TreeError::not_a_file(path.to_string()));
            }
            rows.get(resolved.node.id)?
                .and_then(|node| node.content)
                .ok_or_else(|| TreeError::not_found(path.to_string()))
        })
    }

    /// Direct children of a folder, ordered by name.
    pub fn list(&self, path: &NodePath) -> TreeResult<Vec<NodeSummary>> {
        self.read_with("list", |r| {
            let folder = r.resolve_folder(path)?;
            Ok(Vec::clone(&*r.children(folder.node.id)?))
        })
    }

    /// A folder and each of its direct children with timestamps and sizes,
    /// all from one snapshot. Children are ordered by name.
    pub fn list_stats(&self, path: &NodePath) -> TreeResult<(NodeStat, Vec<NodeStat>)> {
        self.ctl.read("list_stats", |rows, epoch| {
            let r = Resolver::cached(rows, self.ctl.cache(), epoch);
            let folder = r.resolve_folder(path)?.node.id;
            let dir = stat_row(rows, folder)?.ok_or_else(|| TreeError::not_found(path.to_string()))?;
            let children = match stat_children(rows, folder, &r.children(folder)?)? {
                Some(stats) => stats,
                None => {
                    // Cached listing disagrees with this snapshot.
                    self.ctl.cache().evict(&CacheKey::Children(folder));
                    stat_children(rows, folder, &rows.children(folder)?)?
                        .ok_or_else(|| TreeError::conflict(format!("listing of {path} changed")))?
                }
            };
            Ok((dir, children))
        })
    }

    /// Metadata for one node. A folder's size is the total content size of
    /// every file below it.
    pub fn stat(&self, path: &NodePath) -> TreeResult<NodeStat> {
        self.ctl.read("stat", |rows, epoch| {
            let resolved = Resolver::cached(rows, self.ctl.cache(), epoch).resolve(path)?;
            stat_row(rows, resolved.node.id)?.ok_or_else(|| TreeError::not_found(path.to_string()))
        })
    }

    /// Every node below `root` whose name contains `needle`.
    ///
    /// Breadth-first over one snapshot, without the cache. `max_depth`
    /// counts levels below the search root and falls back to the configured
    /// default. The search root itself is never a match.
    pub fn search(
        &self,
        needle: &str,
        root: Option<&NodePath>,
        max_depth: Option<usize>,
    ) -> TreeResult<Vec<SearchHit>> {
        let base_path = root.cloned().unwrap_or_else(NodePath::root);
        let max_depth = max_depth.or(self.find_max_depth);
        self.ctl.read("search", |rows, _| {
            let base = Resolver::store(rows).resolve_folder(&base_path)?;
            let mut hits = Vec::new();
            let mut queue = VecDeque::from([(base.node.id, base_path.clone(), 0usize)]);
            while let Some((folder, path, depth)) = queue.pop_front() {
                if max_depth.is_some_and(|max| depth >= max) {
                    continue;
                }
                for child in rows.children(folder)? {
                    let child_path = path.join(&child.name)?;
                    if child.is_folder() {
                        queue.push_back((child.id, child_path.clone(), depth + 1));
                    }
                    if child.name.contains(needle) {
                        hits.push(SearchHit {
                            path: child_path,
                            node: child,
                        });
                    }
                }
            }
            hits.sort_by(|a, b| a.path.segments().cmp(b.path.segments()));
            tracing::debug!(needle, root = %base_path, matches = hits.len(), "search");
            Ok(hits)
        })
    }

    /// Check every tree invariant against one snapshot.
    pub fn verify(&self) -> TreeResult<Vec<Violation>> {
        self.ctl
            .read("verify", |rows, _| Ok(integrity::check(&rows.all()?)))
    }

    fn read_with<T>(
        &self,
        op: &'static str,
        mut body: impl FnMut(&Resolver<'_, '_>) -> TreeResult<T>,
    ) -> TreeResult<T> {
        self.ctl.read(op, |rows, epoch| {
            body(&Resolver::cached(rows, self.ctl.cache(), epoch))
        })
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create `name` under the folder at `parent`. `None` content makes a
    /// folder. With `parents`, missing folders along `parent` are created.
    pub fn create(
        &self,
        parent: &NodePath,
        name: &str,
        content: Option<Vec<u8>>,
        parents: bool,
    ) -> TreeResult<NodeId> {
        validate_name(name)?;
        self.check_content(content.as_deref())?;
        let id = self.ctl.run("create", |txn| {
            let parent_id = if parents {
                self.ensure_folders(txn, parent)?
            } else {
                Resolver::store(txn.rows()).resolve_folder(parent)?.node.id
            };
            let node = match &content {
                Some(bytes) => Node::file(parent_id, name, bytes.clone()),
                None => Node::folder(parent_id, name),
            };
            self.insert_child(txn, parent, node)
        })?;
        tracing::debug!(parent = %parent, name, %id, "created");
        Ok(id)
    }

    /// Create the node at `path`: its parent is `path`'s parent and its name
    /// is the last segment.
    pub fn create_at(
        &self,
        path: &NodePath,
        content: Option<Vec<u8>>,
        parents: bool,
    ) -> TreeResult<NodeId> {
        let Some(name) = path.file_name() else {
            return Err(TreeError::already_exists("/"));
        };
        self.create(&path.parent(), name, content, parents)
    }

    /// Move `src` into the folder `dst`, optionally renaming it.
    pub fn move_node(&self, src: &NodePath, dst: &NodePath, new_name: Option<&str>) -> TreeResult<()> {
        if src.is_root() {
            return Err(TreeError::invalid("cannot move the root folder"));
        }
        if let Some(name) = new_name {
            validate_name(name)?;
        }
        self.ctl.run("move", |txn| {
            let (source, dest) = {
                let r = Resolver::store(txn.rows());
                (r.resolve(src)?, r.resolve(dst)?)
            };
            if !dest.node.is_folder() {
                return Err(TreeError::not_a_folder(dst.to_string()));
            }
            let id = source.node.id;
            let old_parent = source
                .parent
                .ok_or_else(|| TreeError::invalid("cannot move the root folder"))?;
            let old_name = source.node.name.as_str();
            let name = new_name.unwrap_or(old_name);

            txn.lock_all([id, old_parent, dest.node.id])?;
            self.revalidate(txn, &source)?;

            if dest.node.id == id || txn.ancestors(dest.node.id)?.contains(&id) {
                return Err(TreeError::cycle(src.to_string(), dst.to_string()));
            }
            if dest.node.id == old_parent && name == old_name {
                return Ok(());
            }
            if txn.child(dest.node.id, name)?.is_some() {
                return Err(TreeError::already_exists(child_path(dst, name)));
            }

            let now = txn.now();
            txn.relink(id, dest.node.id, name, now)?;
            txn.touch(old_parent, now)?;
            if dest.node.id != old_parent {
                txn.touch(dest.node.id, now)?;
            }
            txn.invalidate(CacheKey::child(old_parent, old_name));
            txn.invalidate(CacheKey::child(dest.node.id, name));
            txn.invalidate(CacheKey::Children(old_parent));
            txn.invalidate(CacheKey::Children(dest.node.id));
            Ok(())
        })?;
        tracing::debug!(src = %src, dst = %dst, "moved");
        Ok(())
    }

    /// Rename a node in place and/or replace a file's content.
    pub fn update(
        &self,
        path: &NodePath,
        new_name: Option<&str>,
        content: Option<Vec<u8>>,
    ) -> TreeResult<()> {
        if let Some(name) = new_name {
            if path.is_root() {
                return Err(TreeError::invalid("cannot rename the root folder"));
            }
            validate_name(name)?;
        }
        self.check_content(content.as_deref())?;
        self.ctl.run("update", |txn| {
            let target = Resolver::store(txn.rows()).resolve(path)?;
            if content.is_some() && target.node.is_folder() {
                return Err(TreeError::not_a_file(path.to_string()));
            }
            let id = target.node.id;
            txn.lock_all([id].into_iter().chain(target.parent))?;
            self.revalidate(txn, &target)?;
            let now = txn.now();

            if let (Some(name), Some(parent)) = (new_name, target.parent) {
                if name != target.node.name {
                    if txn.child(parent, name)?.is_some() {
                        return Err(TreeError::already_exists(child_path(&path.parent(), name)));
                    }
                    txn.relink(id, parent, name, now)?;
                    txn.touch(parent, now)?;
                    txn.invalidate(CacheKey::child(parent, target.node.name.as_str()));
                    txn.invalidate(CacheKey::child(parent, name));
                    txn.invalidate(CacheKey::Children(parent));
                }
            }
            if let Some(bytes) = &content {
                txn.set_content(id, bytes, now)?;
            }
            Ok(())
        })?;
        tracing::debug!(path = %path, "updated");
        Ok(())
    }

    /// Remove every path, folders with their whole subtree, all or nothing.
    ///
    /// Returns the number of nodes deleted.
    pub fn remove(&self, paths: &[NodePath]) -> TreeResult<usize> {
        if paths.is_empty() {
            return Err(TreeError::invalid("nothing to remove"));
        }
        if paths.iter().any(NodePath::is_root) {
            return Err(TreeError::invalid("cannot remove the root folder"));
        }
        let removed = self.ctl.run("remove", |txn| {
            let mut targets: Vec<Resolved> = Vec::with_capacity(paths.len());
            {
                let r = Resolver::store(txn.rows());
                for path in paths {
                    targets.push(r.resolve(path)?);
                }
            }

            // Targets inside another target go with it.
            let ids: HashSet<NodeId> = targets.iter().map(|t| t.node.id).collect();
            let mut tops: Vec<Resolved> = Vec::new();
            for target in targets {
                let nested = txn
                    .ancestors(target.node.id)?
                    .iter()
                    .any(|a| ids.contains(a));
                if !nested && !tops.iter().any(|t| t.node.id == target.node.id) {
                    tops.push(target);
                }
            }

            let mut doomed: Vec<NodeId> = Vec::new();
            let mut folders: Vec<NodeId> = Vec::new();
            let mut lock_ids: Vec<NodeId> = Vec::new();
            for top in &tops {
                lock_ids.extend(top.parent);
                doomed.push(top.node.id);
                if top.node.is_folder() {
                    folders.push(top.node.id);
                }
                for below in txn.descendants(top.node.id)? {
                    if below.is_folder() {
                        folders.push(below.id);
                    }
                    doomed.push(below.id);
                }
            }
            lock_ids.extend(doomed.iter().copied());
            txn.lock_all(lock_ids)?;
            for top in &tops {
                self.revalidate(txn, top)?;
            }

            // Each subtree is listed top-down by depth; deleting in reverse
            // leaves no row with children behind, so no cascade runs.
            let bottom_up: Vec<NodeId> = doomed.iter().rev().copied().collect();
            let deleted = txn.delete_many(&bottom_up)?;
            if deleted != doomed.len() {
                return Err(TreeError::conflict(format!(
                    "expected to delete {} nodes, deleted {deleted}",
                    doomed.len()
                )));
            }
            let now = txn.now();
            for top in &tops {
                let Some(parent) = top.parent else { continue };
                txn.touch(parent, now)?;
                txn.invalidate(CacheKey::Children(parent));
                txn.invalidate(CacheKey::child(parent, top.node.name.as_str()));
            }
            for folder in folders {
                txn.invalidate(CacheKey::Children(folder));
            }
            Ok(doomed.len())
        })?;
        tracing::debug!(paths = paths.len(), removed, "removed");
        Ok(removed)
    }

    // -------------------------------------------------------------------------

    fn check_content(&self, content: Option<&[u8]>) -> TreeResult<()> {
        match content {
            Some(bytes) if bytes.len() > self.max_content_bytes => Err(TreeError::invalid(format!(
                "content is {} bytes, limit is {}",
                bytes.len(),
                self.max_content_bytes
            ))),
            _ => Ok(()),
        }
    }

    /// Lock the parent, check the slot is free, insert, and queue invalidations.
    fn insert_child(&self, txn: &mut Txn<'_>, parent_path: &NodePath, node: Node) -> TreeResult<NodeId> {
        let parent_id = node
            .parent_id
            .ok_or_else(|| TreeError::invalid("a new node needs a parent"))?;
        let parent = txn.lock(parent_id)?;
        if !parent.is_folder() {
            return Err(TreeError::not_a_folder(parent_path.to_string()));
        }
        if txn.child(parent_id, &node.name)?.is_some() {
            return Err(TreeError::already_exists(child_path(parent_path, &node.name)));
        }
        txn.insert(&node)?;
        txn.touch(parent_id, txn.now())?;
        txn.invalidate(CacheKey::Children(parent_id));
        txn.invalidate(CacheKey::child(parent_id, node.name.as_str()));
        Ok(node.id)
    }

    /// Walk `path` from the root, creating missing folders. Returns the last folder.
    fn ensure_folders(&self, txn: &mut Txn<'_>, path: &NodePath) -> TreeResult<NodeId> {
        let mut current = self.root;
        let mut current_path = NodePath::root();
        for name in path.segments() {
            let existing = txn.child(current, name)?;
            let next_path = current_path.join(name)?;
            current = match existing {
                Some(child) if child.is_folder() => child.id,
                Some(_) => return Err(TreeError::not_a_folder(next_path.to_string())),
                None => self.insert_child(txn, &current_path, Node::folder(current, name.as_str()))?,
            };
            current_path = next_path;
        }
        Ok(current)
    }

    /// After locking: the row must still be where resolution found it.
    fn revalidate(&self, txn: &Txn<'_>, resolved: &Resolved) -> TreeResult<()> {
        let current = txn
            .get(resolved.node.id)?
            .ok_or_else(|| TreeError::conflict(format!("node {} disappeared", resolved.node.id)))?;
        if current.parent_id != resolved.parent || current.name != resolved.node.name {
            return Err(TreeError::conflict(format!(
                "node {} moved during the operation",
                resolved.node.id
            )));
        }
        Ok(())
    }
}

fn stat_row(rows: &NodeRows<'_>, id: NodeId) -> TreeResult<Option<NodeStat>> {
    let Some(node) = rows.get(id)? else {
        return Ok(None);
    };
    let size = match &node.content {
        Some(content) => content.len() as u64,
        None => rows.subtree_size(node.id)?,
    };
    Ok(Some(NodeStat {
        summary: node.summary(),
        parent_id: node.parent_id,
        created_at: node.created_at,
        updated_at: node.updated_at,
        size,
    }))
}

/// Stats for `listed`, or `None` if any entry is not a child of `folder`
/// in this snapshot.
fn stat_children(
    rows: &NodeRows<'_>,
    folder: NodeId,
    listed: &[NodeSummary],
) -> TreeResult<Option<Vec<NodeStat>>> {
    let mut stats = Vec::with_capacity(listed.len());
    for child in listed {
        match stat_row(rows, child.id)? {
            Some(stat) if stat.parent_id == Some(folder) && stat.summary == *child => {
                stats.push(stat)
            }
            _ => return Ok(None),
        }
    }
    Ok(Some(stats))
}

fn child_path(parent: &NodePath, name: &str) -> String {
    if parent.is_root() {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use treefs_types::NodeKind;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    fn names(list: &[NodeSummary]) -> Vec<&str> {
        list.iter().map(|n| n.name.as_str()).collect()
    }

    fn repo() -> TreeRepository {
        TreeRepository::in_memory().unwrap()
    }

    fn node(repo: &TreeRepository, id: NodeId) -> Node {
        repo.controller()
            .read("test", |rows, _| rows.get(id))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_create_and_list() {
        let repo = repo();
        repo.create(&p("/"), "docs", None, false).unwrap();
        repo.create(&p("/docs"), "work", None, false).unwrap();
        let listing = repo.list(&p("/docs")).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "work");
        assert_eq!(listing[0].kind, NodeKind::Folder);
    }

    #[test]
    fn test_create_file_and_read() {
        let repo = repo();
        repo.create_at(&p("/docs/work"), None, true).unwrap();
        repo.create(&p("/docs/work"), "note.txt", Some(b"hello".to_vec()), false)
            .unwrap();
        assert_eq!(repo.read(&p("/docs/work/note.txt")).unwrap(), b"hello");
        assert!(matches!(repo.read(&p("/docs")), Err(TreeError::NotAFile(_))));
        assert!(matches!(repo.read(&p("/docs/nope")), Err(TreeError::NotFound(_))));
    }

    #[test]
    fn test_create_errors() {
        let repo = repo();
        repo.create(&p("/"), "f", Some(b"x".to_vec()), false).unwrap();

        assert!(matches!(
            repo.create(&p("/missing"), "a", None, false),
            Err(TreeError::NotFound(_))
        ));
        assert!(matches!(
            repo.create(&p("/f"), "a", None, false),
            Err(TreeError::NotAFolder(_))
        ));
        assert!(matches!(
            repo.create(&p("/f/deeper"), "a", None, true),
            Err(TreeError::NotAFolder(_))
        ));
        match repo.create(&p("/"), "f", None, false) {
            Err(TreeError::AlreadyExists(path)) => assert_eq!(path, "/f"),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
        assert!(matches!(
            repo.create(&p("/"), "a/b", None, false),
            Err(TreeError::InvalidArgument(_))
        ));
        assert!(matches!(
            repo.create_at(&p("/"), None, false),
            Err(TreeError::AlreadyExists(_))
        ));
        assert!(repo.verify().unwrap().is_empty());
    }

    #[test]
    fn test_create_parents() {
        let repo = repo();
        let id = repo.create(&p("/a/b/c"), "leaf", None, true).unwrap();
        assert_eq!(repo.path_of(id).unwrap().to_string(), "/a/b/c/leaf");
        // Existing intermediates are reused.
        repo.create(&p("/a/b"), "other", None, true).unwrap();
        assert_eq!(names(&repo.list(&p("/a/b")).unwrap()), ["c", "other"]);
    }

    #[test]
    fn test_content_limit() {
        let config = TreeConfig {
            max_content_bytes: 4,
            ..TreeConfig::default()
        };
        let repo = TreeRepository::open(&config).unwrap();
        assert!(matches!(
            repo.create(&p("/"), "big", Some(vec![0; 5]), false),
            Err(TreeError::InvalidArgument(_))
        ));
        repo.create(&p("/"), "ok", Some(vec![0; 4]), false).unwrap();
    }

    #[test]
    fn test_list_file_is_not_a_folder() {
        let repo = repo();
        repo.create(&p("/"), "f", Some(Vec::new()), false).unwrap();
        assert!(matches!(repo.list(&p("/f")), Err(TreeError::NotAFolder(_))));
        assert!(repo.list(&p("/")).unwrap().len() == 1);
    }

    #[test]
    fn test_move_relocates_one_row() {
        let repo = repo();
        let work = repo.create_at(&p("/docs/work"), None, true).unwrap();
        let deep = repo.create_at(&p("/docs/work/a/b"), None, true).unwrap();
        let note = repo
            .create(&p("/docs/work/a"), "note", Some(b"n".to_vec()), false)
            .unwrap();
        repo.create_at(&p("/docs/second_work"), None, false).unwrap();

        let deep_parent = node(&repo, deep).parent_id;
        let note_parent = node(&repo, note).parent_id;
        repo.move_node(&p("/docs/work"), &p("/docs/second_work"), None)
            .unwrap();

        assert_eq!(names(&repo.list(&p("/docs")).unwrap()), ["second_work"]);
        assert_eq!(names(&repo.list(&p("/docs/second_work")).unwrap()), ["work"]);
        assert_eq!(repo.resolve(&p("/docs/second_work/work")).unwrap().id, work);
        assert_eq!(node(&repo, deep).parent_id, deep_parent);
        assert_eq!(node(&repo, note).parent_id, note_parent);
        assert_eq!(
            repo.read(&p("/docs/second_work/work/a/note")).unwrap(),
            b"n"
        );
        assert!(matches!(
            repo.resolve(&p("/docs/work")),
            Err(TreeError::NotFound(_))
        ));
    }

    #[test]
    fn test_move_with_rename_and_noop() {
        let repo = repo();
        repo.create_at(&p("/a"), None, false).unwrap();
        let f = repo.create_at(&p("/a/f"), Some(b"1".to_vec()), false).unwrap();
        repo.move_node(&p("/a/f"), &p("/"), Some("g")).unwrap();
        assert_eq!(repo.resolve(&p("/g")).unwrap().id, f);
        assert!(repo.list(&p("/a")).unwrap().is_empty());

        let before = node(&repo, f);
        repo.move_node(&p("/g"), &p("/"), None).unwrap();
        assert_eq!(node(&repo, f), before);
    }

    #[test]
    fn test_move_errors_leave_tree_unchanged() {
        let repo = repo();
        repo.create_at(&p("/a/b/c"), None, true).unwrap();
        repo.create_at(&p("/x"), None, false).unwrap();
        repo.create_at(&p("/x/b"), None, false).unwrap();
        repo.create_at(&p("/file"), Some(Vec::new()), false).unwrap();

        assert!(matches!(
            repo.move_node(&p("/a"), &p("/a/b/c"), None),
            Err(TreeError::CycleDetected { .. })
        ));
        assert!(matches!(
            repo.move_node(&p("/a"), &p("/a"), None),
            Err(TreeError::CycleDetected { .. })
        ));
        assert!(matches!(
            repo.move_node(&p("/a/b"), &p("/x"), None),
            Err(TreeError::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.move_node(&p("/a"), &p("/file"), None),
            Err(TreeError::NotAFolder(_))
        ));
        assert!(matches!(
            repo.move_node(&p("/nope"), &p("/x"), None),
            Err(TreeError::NotFound(_))
        ));
        assert!(matches!(
            repo.move_node(&p("/"), &p("/x"), None),
            Err(TreeError::InvalidArgument(_))
        ));
        assert_eq!(names(&repo.list(&p("/a/b")).unwrap()), ["c"]);
        assert!(repo.verify().unwrap().is_empty());
    }

    #[test]
    fn test_update_rename_and_content() {
        let repo = repo();
        let id = repo.create_at(&p("/notes"), Some(b"v1".to_vec()), false).unwrap();
        repo.create_at(&p("/taken"), None, false).unwrap();

        repo.update(&p("/notes"), Some("renamed"), Some(b"v2".to_vec()))
            .unwrap();
        assert_eq!(repo.resolve(&p("/renamed")).unwrap().id, id);
        assert_eq!(repo.read(&p("/renamed")).unwrap(), b"v2");
        assert!(matches!(repo.resolve(&p("/notes")), Err(TreeError::NotFound(_))));

        assert!(matches!(
            repo.update(&p("/renamed"), Some("taken"), None),
            Err(TreeError::AlreadyExists(_))
        ));
        assert!(matches!(
            repo.update(&p("/taken"), None, Some(b"x".to_vec())),
            Err(TreeError::NotAFile(_))
        ));
        assert!(matches!(
            repo.update(&p("/"), Some("new_root"), None),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_cascades() {
        let repo = repo();
        repo.create_at(&p("/docs/work"), None, true).unwrap();
        repo.create(&p("/docs/work"), "note.txt", Some(b"hello".to_vec()), false)
            .unwrap();
        repo.create_at(&p("/keep"), None, false).unwrap();

        assert_eq!(repo.remove(&[p("/docs")]).unwrap(), 3);
        assert!(matches!(
            repo.read(&p("/docs/work/note.txt")),
            Err(TreeError::NotFound(_))
        ));
        assert_eq!(names(&repo.list(&p("/")).unwrap()), ["keep"]);
        assert!(repo.verify().unwrap().is_empty());
    }

    #[test]
    fn test_remove_is_all_or_nothing() {
        let repo = repo();
        repo.create_at(&p("/a"), None, false).unwrap();
        repo.create_at(&p("/b"), None, false).unwrap();
        assert!(matches!(
            repo.remove(&[p("/a"), p("/missing"), p("/b")]),
            Err(TreeError::NotFound(_))
        ));
        assert_eq!(names(&repo.list(&p("/")).unwrap()), ["a", "b"]);
        assert!(matches!(
            repo.remove(&[p("/a"), p("/")]),
            Err(TreeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_remove_nested_and_duplicate_targets() {
        let repo = repo();
        repo.create_at(&p("/a/b/c"), None, true).unwrap();
        let removed = repo
            .remove(&[p("/a/b"), p("/a"), p("/a/b/c"), p("/a")])
            .unwrap();
        assert_eq!(removed, 3);
        assert!(repo.list(&p("/")).unwrap().is_empty());
    }

    #[test]
    fn test_stat_sizes_and_parent_timestamps() {
        let repo = repo();
        repo.create_at(&p("/d/e"), None, true).unwrap();
        repo.create_at(&p("/d/one"), Some(vec![1; 3]), false).unwrap();
        repo.create_at(&p("/d/e/two"), Some(vec![2; 4]), false).unwrap();

        let file = repo.stat(&p("/d/one")).unwrap();
        assert_eq!(file.size, 3);
        assert_eq!(file.summary.kind, NodeKind::File);
        assert_eq!(repo.stat(&p("/d")).unwrap().size, 7);
        assert_eq!(repo.stat(&p("/")).unwrap().size, 7);

        let before = repo.stat(&p("/d/e")).unwrap().updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        repo.remove(&[p("/d/e/two")]).unwrap();
        assert!(repo.stat(&p("/d/e")).unwrap().updated_at > before);
    }

    #[test]
    fn test_search_substring_depth_and_order() {
        let repo = repo();
        repo.create_at(&p("/docs/work"), None, true).unwrap();
        repo.create_at(&p("/docs/second_work"), None, false).unwrap();
        repo.create_at(&p("/docs/work/homework.txt"), Some(Vec::new()), false)
            .unwrap();
        repo.create_at(&p("/other/work"), None, true).unwrap();

        let hits: Vec<String> = repo
            .search("work", Some(&p("/docs")), None)
            .unwrap()
            .into_iter()
            .map(|h| h.path.to_string())
            .collect();
        assert_eq!(
            hits,
            ["/docs/second_work", "/docs/work", "/docs/work/homework.txt"]
        );

        let shallow = repo.search("work", Some(&p("/docs")), Some(1)).unwrap();
        assert_eq!(shallow.len(), 2);

        // Case-sensitive, and the search root is never a match.
        assert!(repo.search("WORK", None, None).unwrap().is_empty());
        assert!(repo.search("work", Some(&p("/docs/work")), None).unwrap().len() == 1);
        assert_eq!(repo.search("", None, None).unwrap().len(), 6);
        let under_docs: Vec<String> = repo
            .search("", Some(&p("/docs")), None)
            .unwrap()
            .into_iter()
            .map(|h| h.path.to_string())
            .collect();
        assert_eq!(
            under_docs,
            ["/docs/second_work", "/docs/work", "/docs/work/homework.txt"]
        );
    }

    #[test]
    fn test_list_stats_ignores_stale_cached_listing() {
        let repo = repo();
        repo.create(&p("/"), "docs", None, false).unwrap();
        repo.create(&p("/docs"), "a.txt", Some(b"abc".to_vec()), false)
            .unwrap();
        let docs = repo.resolve(&p("/docs")).unwrap().id;

        let cache = repo.controller().cache();
        let ghost = NodeSummary {
            id: NodeId::new(),
            name: "ghost".into(),
            kind: NodeKind::File,
        };
        cache.fill_children(cache.begin_read(), docs, Arc::new(vec![ghost]));

        let (dir, children) = repo.list_stats(&p("/docs")).unwrap();
        assert_eq!(dir.summary.id, docs);
        assert_eq!(dir.size, 3);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].summary.name, "a.txt");
        assert_eq!(children[0].size, 3);
        assert_eq!(names(&repo.list(&p("/docs")).unwrap()), ["a.txt"]);
    }

    #[test]
    fn test_cache_stats_count_hits() {
        let repo = repo();
        repo.create_at(&p("/a/b"), None, true).unwrap();
        repo.resolve(&p("/a/b")).unwrap();
        let warm = repo.cache_stats().unwrap();
        repo.resolve(&p("/a/b")).unwrap();
        let after = repo.cache_stats().unwrap();
        assert_eq!(after.hits, warm.hits + 2);
        assert_eq!(after.misses, warm.misses);
        assert!(after.entries >= 2);
    }

    #[test]
    fn test_cache_sees_mutations() {
        let repo = repo();
        repo.create_at(&p("/d"), None, false).unwrap();
        assert!(repo.list(&p("/d")).unwrap().is_empty());
        repo.create_at(&p("/d/x"), None, false).unwrap();
        assert_eq!(names(&repo.list(&p("/d")).unwrap()), ["x"]);

        repo.resolve(&p("/d/x")).unwrap();
        repo.update(&p("/d/x"), Some("y"), None).unwrap();
        assert!(repo.resolve(&p("/d/x")).is_err());
        assert_eq!(names(&repo.list(&p("/d")).unwrap()), ["y"]);

        repo.remove(&[p("/d/y")]).unwrap();
        assert!(repo.list(&p("/d")).unwrap().is_empty());
        assert!(repo.resolve(&p("/d/y")).is_err());
    }
}
