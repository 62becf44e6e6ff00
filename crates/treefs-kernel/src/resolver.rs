//! Path resolution.
//!
//! Paths are resolved one segment at a time: starting at the root, look up
//! the child of the current folder with the next name. Each `(parent, name)`
//! step is the unit of caching.
//!
//! Mutations resolve with [`Resolver::store`] inside their own transaction,
//! so their decisions rest on the store alone. Reads use
//! [`Resolver::cached`]; a cached walk that ends in a miss or in a node the
//! snapshot disagrees with is evicted and redone against the store.

use std::collections::HashSet;
use std::sync::Arc;

use treefs_types::{NodeId, NodeSummary};

use crate::cache::{CacheKey, ChildRef, TreeCache};
use crate::db::NodeRows;
use crate::error::{TreeError, TreeResult};
use crate::path::NodePath;

/// A resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub node: NodeSummary,
    /// `None` only for the root.
    pub parent: Option<NodeId>,
}

/// Where lookups go.
#[derive(Clone, Copy)]
enum Lookup<'a> {
    Store,
    Cached { cache: &'a TreeCache, epoch: u64 },
}

/// Resolves paths against one snapshot.
pub struct Resolver<'r, 'c> {
    rows: &'r NodeRows<'c>,
    lookup: Lookup<'r>,
}

impl<'r, 'c> Resolver<'r, 'c> {
    /// Authoritative resolver: every step reads the store.
    pub fn store(rows: &'r NodeRows<'c>) -> Self {
        Self {
            rows,
            lookup: Lookup::Store,
        }
    }

    /// Cache-assisted resolver. `epoch` must be sampled before the snapshot.
    pub fn cached(rows: &'r NodeRows<'c>, cache: &'r TreeCache, epoch: u64) -> Self {
        Self {
            rows,
            lookup: Lookup::Cached { cache, epoch },
        }
    }

    pub fn root(&self) -> TreeResult<NodeSummary> {
        self.rows
            .root()?
            .map(|root| root.summary())
            .ok_or_else(|| TreeError::other("tree has no root folder"))
    }

    /// Resolve an absolute path.
    pub fn resolve(&self, path: &NodePath) -> TreeResult<Resolved> {
        let Lookup::Cached { cache, .. } = self.lookup else {
            return self.walk(path, &mut Vec::new());
        };

        let mut hits = Vec::new();
        let outcome = self.walk(path, &mut hits);
        if hits.is_empty() {
            return outcome;
        }
        let trusted = match &outcome {
            Ok(found) => self.confirm(found)?,
            Err(TreeError::NotFound(_) | TreeError::NotAFolder(_)) => false,
            Err(_) => true,
        };
        if trusted {
            return outcome;
        }
        tracing::debug!(path = %path, stale = hits.len(), "stale cache walk, resolving from store");
        for key in &hits {
            cache.evict(key);
        }
        Resolver::store(self.rows).walk(path, &mut Vec::new())
    }

    /// Resolve a path that must name a folder.
    pub fn resolve_folder(&self, path: &NodePath) -> TreeResult<Resolved> {
        let resolved = self.resolve(path)?;
        if resolved.node.is_folder() {
            Ok(resolved)
        } else {
            Err(TreeError::not_a_folder(path.to_string()))
        }
    }

    /// Direct children of a folder, ordered by name.
    pub fn children(&self, folder: NodeId) -> TreeResult<Arc<Vec<NodeSummary>>> {
        match self.lookup {
            Lookup::Store => Ok(Arc::new(self.rows.children(folder)?)),
            Lookup::Cached { cache, epoch } => {
                if let Some(list) = cache.children(folder) {
                    return Ok(list);
                }
                let list = Arc::new(self.rows.children(folder)?);
                cache.fill_children(epoch, folder, Arc::clone(&list));
                Ok(list)
            }
        }
    }

    /// Absolute path of a node, from its parent chain.
    pub fn path_of(&self, id: NodeId) -> TreeResult<NodePath> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;
        loop {
            if !seen.insert(current) {
                return Err(TreeError::other(format!("parent chain of {id} loops")));
            }
            let node = self
                .rows
                .get(current)?
                .ok_or_else(|| TreeError::not_found(format!("node {current}")))?;
            match node.parent_id {
                Some(parent) => {
                    names.push(node.name);
                    current = parent;
                }
                None => break,
            }
        }
        names.reverse();
        Ok(NodePath::from_segments(names))
    }

    fn walk(&self, path: &NodePath, hits: &mut Vec<CacheKey>) -> TreeResult<Resolved> {
        let mut current = self.root()?;
        let mut parent = None;
        let segments = path.segments();
        for (i, name) in segments.iter().enumerate() {
            if !current.is_folder() {
                return Err(TreeError::not_a_folder(prefix(segments, i)));
            }
            let next = self
                .child(current.id, name, hits)?
                .ok_or_else(|| TreeError::not_found(prefix(segments, i + 1)))?;
            parent = Some(current.id);
            current = next;
        }
        Ok(Resolved {
            node: current,
            parent,
        })
    }

    fn child(
        &self,
        parent: NodeId,
        name: &str,
        hits: &mut Vec<CacheKey>,
    ) -> TreeResult<Option<NodeSummary>> {
        let Lookup::Cached { cache, epoch } = self.lookup else {
            return self.rows.child(parent, name);
        };
        if let Some(ChildRef { id, kind }) = cache.child(parent, name) {
            hits.push(CacheKey::child(parent, name));
            return Ok(Some(NodeSummary {
                id,
                name: name.to_string(),
                kind,
            }));
        }
        let found = self.rows.child(parent, name)?;
        if let Some(child) = &found {
            let child_ref = ChildRef {
                id: child.id,
                kind: child.kind,
            };
            cache.fill_child(epoch, parent, name, child_ref);
        }
        Ok(found)
    }

    /// Does the snapshot agree with a cache-assisted result?
    fn confirm(&self, found: &Resolved) -> TreeResult<bool> {
        let Some(node) = self.rows.get(found.node.id)? else {
            return Ok(false);
        };
        Ok(node.parent_id == found.parent
            && node.name == found.node.name
            && node.kind == found.node.kind)
    }
}

fn prefix(segments: &[String], len: usize) -> String {
    NodePath::from_segments(segments[..len].to_vec()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::db::NodeDb;
    use treefs_types::{Node, NodeKind};

    struct Fixture {
        db: NodeDb,
        cache: TreeCache,
        root: NodeId,
        docs: NodeId,
        work: NodeId,
        note: NodeId,
    }

    /// `/docs/work/note.txt`
    fn fixture() -> Fixture {
        let db = NodeDb::in_memory().unwrap();
        let (root, docs, work, note) = {
            let conn = db.checkout().unwrap();
            let rows = NodeRows::new(&conn);
            let root = rows.root().unwrap().unwrap().id;
            let docs = Node::folder(root, "docs");
            let work = Node::folder(docs.id, "work");
            let note = Node::file(work.id, "note.txt", b"hello".to_vec());
            for n in [&docs, &work, &note] {
                rows.insert(n).unwrap();
            }
            (root, docs.id, work.id, note.id)
        };
        Fixture {
            db,
            cache: TreeCache::from_config(&CacheConfig::default()),
            root,
            docs,
            work,
            note,
        }
    }

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    #[test]
    fn test_resolve_store() {
        let f = fixture();
        let conn = f.db.checkout().unwrap();
        let rows = NodeRows::new(&conn);
        let r = Resolver::store(&rows);

        let root = r.resolve(&p("/")).unwrap();
        assert_eq!(root.node.id, f.root);
        assert_eq!(root.parent, None);

        let note = r.resolve(&p("/docs/work/note.txt")).unwrap();
        assert_eq!(note.node.id, f.note);
        assert_eq!(note.node.kind, NodeKind::File);
        assert_eq!(note.parent, Some(f.work));
    }

    #[test]
    fn test_resolve_errors() {
        let f = fixture();
        let conn = f.db.checkout().unwrap();
        let rows = NodeRows::new(&conn);
        let r = Resolver::store(&rows);

        match r.resolve(&p("/docs/missing/x")) {
            Err(TreeError::NotFound(path)) => assert_eq!(path, "/docs/missing"),
            other => panic!("expected NotFound, got {other:?}"),
        }
        match r.resolve(&p("/docs/work/note.txt/deeper")) {
            Err(TreeError::NotAFolder(path)) => assert_eq!(path, "/docs/work/note.txt"),
            other => panic!("expected NotAFolder, got {other:?}"),
        }
        assert!(matches!(
            r.resolve_folder(&p("/docs/work/note.txt")),
            Err(TreeError::NotAFolder(_))
        ));
    }

    #[test]
    fn test_cached_walk_fills_and_hits() {
        let f = fixture();
        let conn = f.db.checkout().unwrap();
        let rows = NodeRows::new(&conn);
        let epoch = f.cache.begin_read();
        let r = Resolver::cached(&rows, &f.cache, epoch);

        r.resolve(&p("/docs/work")).unwrap();
        assert_eq!(f.cache.child(f.root, "docs").map(|c| c.id), Some(f.docs));
        assert_eq!(f.cache.child(f.docs, "work").map(|c| c.id), Some(f.work));

        // Negative lookups are never cached.
        assert!(r.resolve(&p("/docs/nope")).is_err());
        assert!(f.cache.child(f.docs, "nope").is_none());

        let listing = r.children(f.work).unwrap();
        assert_eq!(listing.len(), 1);
        assert!(f.cache.children(f.work).is_some());
    }

    #[test]
    fn test_stale_cache_entry_falls_back_to_store() {
        let f = fixture();
        let conn = f.db.checkout().unwrap();
        let rows = NodeRows::new(&conn);

        // A bogus entry as if an invalidation had been lost.
        let epoch = f.cache.begin_read();
        let ghost = ChildRef {
            id: NodeId::new(),
            kind: NodeKind::Folder,
        };
        f.cache.fill_child(epoch, f.root, "docs", ghost);

        let r = Resolver::cached(&rows, &f.cache, epoch);
        let work = r.resolve(&p("/docs/work")).unwrap();
        assert_eq!(work.node.id, f.work);
        assert_ne!(f.cache.child(f.root, "docs"), Some(ghost));
    }

    #[test]
    fn test_path_of() {
        let f = fixture();
        let conn = f.db.checkout().unwrap();
        let rows = NodeRows::new(&conn);
        let r = Resolver::store(&rows);
        assert_eq!(r.path_of(f.note).unwrap().to_string(), "/docs/work/note.txt");
        assert!(r.path_of(f.root).unwrap().is_root());
        assert!(matches!(r.path_of(NodeId::new()), Err(TreeError::NotFound(_))));
    }
}
