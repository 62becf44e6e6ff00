//! SQLite node store.
//!
//! One table of nodes linked by `parent_id`. The schema enforces every tree
//! invariant it can express: a single root, unique sibling names, folder-only
//! parents, content iff file, and cascading deletes. Absolute paths are never
//! stored.
//!
//! File-backed stores run in WAL mode and open one connection per
//! transaction, so readers work on their own snapshot while a writer
//! commits. In-memory stores share a single connection behind a mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use treefs_types::{Node, NodeId, NodeKind, NodeSummary};

use crate::error::{TreeError, TreeResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('folder', 'file')),
    parent_id BLOB REFERENCES nodes(id) ON DELETE CASCADE,
    content BLOB,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (parent_id, name),
    CHECK ((kind = 'file') = (content IS NOT NULL)),
    CHECK (parent_id IS NOT NULL OR kind = 'folder'),
    CHECK (parent_id IS NULL OR length(name) > 0)
);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id);

-- Exactly one row may have no parent.
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_single_root
    ON nodes(kind) WHERE parent_id IS NULL;

-- Files never have children.
CREATE TRIGGER IF NOT EXISTS nodes_parent_is_folder_insert
BEFORE INSERT ON nodes
WHEN NEW.parent_id IS NOT NULL
    AND (SELECT kind FROM nodes WHERE id = NEW.parent_id) = 'file'
BEGIN
    SELECT RAISE(ABORT, 'parent is not a folder');
END;

CREATE TRIGGER IF NOT EXISTS nodes_parent_is_folder_update
BEFORE UPDATE OF parent_id ON nodes
WHEN NEW.parent_id IS NOT NULL
    AND (SELECT kind FROM nodes WHERE id = NEW.parent_id) = 'file'
BEGIN
    SELECT RAISE(ABORT, 'parent is not a folder');
END;
"#;

const NODE_COLUMNS: &str = "id, name, kind, parent_id, content, created_at, updated_at";

/// Where connections come from.
enum Backing {
    File(PathBuf),
    Memory(Arc<Mutex<Connection>>),
}

/// Database handle for the node table.
pub struct NodeDb {
    backing: Backing,
    busy_timeout: Duration,
}

/// A checked-out connection. Owned for file stores, a guard for memory stores.
pub enum DbConn<'a> {
    Owned(Connection),
    Shared(MutexGuard<'a, Connection>),
}

impl std::ops::Deref for DbConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            DbConn::Owned(conn) => conn,
            DbConn::Shared(guard) => &**guard,
        }
    }
}

impl NodeDb {
    /// Open or create a database at the given path, bootstrapping the root.
    pub fn open<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> TreeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "opened node store");
        Self::configure(&conn, busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        let db = Self {
            backing: Backing::File(path),
            busy_timeout,
        };
        db.bootstrap(&conn)?;
        Ok(db)
    }

    /// Create an in-memory database (for testing and ephemeral trees).
    pub fn in_memory() -> TreeResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn, Duration::ZERO)?;
        conn.execute_batch(SCHEMA)?;
        let db = Self {
            backing: Backing::Memory(Arc::new(Mutex::new(conn))),
            busy_timeout: Duration::ZERO,
        };
        {
            let conn = db.checkout()?;
            db.bootstrap(&conn)?;
        }
        Ok(db)
    }

    fn configure(conn: &Connection, busy_timeout: Duration) -> TreeResult<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(())
    }

    /// Check out a connection for one transaction.
    pub fn checkout(&self) -> TreeResult<DbConn<'_>> {
        match &self.backing {
            Backing::File(path) => {
                let conn = Connection::open(path)?;
                Self::configure(&conn, self.busy_timeout)?;
                Ok(DbConn::Owned(conn))
            }
            Backing::Memory(shared) => Ok(DbConn::Shared(shared.lock())),
        }
    }

    /// Database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File(path) => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Create the root folder if it does not exist yet.
    ///
    /// Runs under an immediate transaction; the single-root index turns a
    /// racing second bootstrap into a constraint failure, which we treat as
    /// "someone else got there first".
    fn bootstrap(&self, conn: &Connection) -> TreeResult<NodeId> {
        let tx = rusqlite::Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let rows = NodeRows::new(&tx);
        if let Some(root) = rows.root()? {
            return Ok(root.id);
        }
        let root = Node::root();
        match rows.insert(&root) {
            Ok(()) => {
                tx.commit()?;
                tracing::info!(root = %root.id, "bootstrapped root folder");
                Ok(root.id)
            }
            Err(TreeError::AlreadyExists(_)) => {
                drop(tx);
                NodeRows::new(conn)
                    .root()?
                    .map(|r| r.id)
                    .ok_or_else(|| TreeError::other("root vanished during bootstrap"))
            }
            Err(e) => Err(e),
        }
    }
}

/// Typed queries over one connection (normally inside a transaction).
///
/// Every method reads or writes through the connection's current snapshot.
pub struct NodeRows<'c> {
    conn: &'c Connection,
}

impl<'c> NodeRows<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The root folder.
    pub fn root(&self) -> TreeResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_id IS NULL");
        Ok(self.conn.query_row(&sql, [], row_to_node).optional()?)
    }

    /// Get a node by ID.
    pub fn get(&self, id: NodeId) -> TreeResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![id_param(&id)], row_to_node)
            .optional()?)
    }

    /// Look up one child of `parent` by name.
    pub fn child(&self, parent: NodeId, name: &str) -> TreeResult<Option<NodeSummary>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, kind FROM nodes WHERE parent_id = ?1 AND name = ?2",
                params![id_param(&parent), name],
                row_to_summary,
            )
            .optional()?)
    }

    /// Direct children of `parent`, ordered by name.
    pub fn children(&self, parent: NodeId) -> TreeResult<Vec<NodeSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, kind FROM nodes WHERE parent_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![id_param(&parent)], row_to_summary)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Every node strictly below `id`, breadth-first by depth.
    pub fn descendants(&self, id: NodeId) -> TreeResult<Vec<NodeSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "WITH RECURSIVE sub(id, name, kind, depth) AS (
                 SELECT id, name, kind, 1 FROM nodes WHERE parent_id = ?1
                 UNION ALL
                 SELECT n.id, n.name, n.kind, sub.depth + 1
                 FROM nodes n JOIN sub ON n.parent_id = sub.id
             )
             SELECT id, name, kind FROM sub ORDER BY depth",
        )?;
        let rows = stmt.query_map(params![id_param(&id)], row_to_summary)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// IDs on the parent chain of `id`, nearest first, ending at the root.
    ///
    /// Bounded by the table size so a corrupt parent cycle cannot spin forever.
    pub fn ancestors(&self, id: NodeId) -> TreeResult<Vec<NodeId>> {
        let mut stmt = self.conn.prepare_cached(
            "WITH RECURSIVE up(id, parent_id, steps) AS (
                 SELECT id, parent_id, 0 FROM nodes WHERE id = ?1
                 UNION ALL
                 SELECT n.id, n.parent_id, up.steps + 1
                 FROM nodes n JOIN up ON n.id = up.parent_id
                 WHERE up.steps < (SELECT count(*) FROM nodes)
             )
             SELECT id FROM up WHERE steps > 0 ORDER BY steps",
        )?;
        let rows = stmt.query_map(params![id_param(&id)], |row| id_column(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Total content bytes of `id` and everything below it.
    pub fn subtree_size(&self, id: NodeId) -> TreeResult<u64> {
        let size: i64 = self.conn.query_row(
            "WITH RECURSIVE sub(id) AS (
                 SELECT ?1
                 UNION ALL
                 SELECT n.id FROM nodes n JOIN sub ON n.parent_id = sub.id
             )
             SELECT COALESCE(SUM(length(n.content)), 0)
             FROM nodes n JOIN sub ON n.id = sub.id",
            params![id_param(&id)],
            |row| row.get(0),
        )?;
        Ok(size.max(0) as u64)
    }

    /// Number of nodes, root included.
    pub fn count(&self) -> TreeResult<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM nodes", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Every node row. Used by the integrity checker.
    pub fn all(&self) -> TreeResult<Vec<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_node)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert a new node.
    pub fn insert(&self, node: &Node) -> TreeResult<()> {
        self.conn.execute(
            "INSERT INTO nodes (id, name, kind, parent_id, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id_param(&node.id),
                node.name,
                node.kind.as_str(),
                node.parent_id.as_ref().map(id_param),
                node.content,
                node.created_at as i64,
                node.updated_at as i64,
            ],
        )?;
        Ok(())
    }

    /// Re-parent and/or rename a node. Its children are untouched.
    pub fn relink(&self, id: NodeId, parent: NodeId, name: &str, now: u64) -> TreeResult<()> {
        let changed = self.conn.execute(
            "UPDATE nodes SET parent_id = ?2, name = ?3, updated_at = ?4 WHERE id = ?1",
            params![id_param(&id), id_param(&parent), name, now as i64],
        )?;
        expect_one(changed, id)
    }

    /// Replace a file's content.
    pub fn set_content(&self, id: NodeId, content: &[u8], now: u64) -> TreeResult<()> {
        let changed = self.conn.execute(
            "UPDATE nodes SET content = ?2, updated_at = ?3 WHERE id = ?1 AND kind = 'file'",
            params![id_param(&id), content, now as i64],
        )?;
        expect_one(changed, id)
    }

    /// Bump `updated_at`.
    pub fn touch(&self, id: NodeId, now: u64) -> TreeResult<()> {
        self.conn.execute(
            "UPDATE nodes SET updated_at = ?2 WHERE id = ?1",
            params![id_param(&id), now as i64],
        )?;
        Ok(())
    }

    /// Delete a batch of nodes. Returns how many rows went away.
    pub fn delete_many(&self, ids: &[NodeId]) -> TreeResult<usize> {
        let mut stmt = self.conn.prepare_cached("DELETE FROM nodes WHERE id = ?1")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute(params![id_param(id)])?;
        }
        Ok(deleted)
    }
}

fn expect_one(changed: usize, id: NodeId) -> TreeResult<()> {
    if changed == 1 {
        Ok(())
    } else {
        Err(TreeError::conflict(format!("node {id} changed underneath")))
    }
}

fn id_param(id: &NodeId) -> &[u8] {
    id.as_bytes().as_slice()
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NodeId> {
    let bytes: Vec<u8> = row.get(idx)?;
    NodeId::try_from_slice(&bytes).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("node id must be 16 bytes, got {}", bytes.len()).into(),
        )
    })
}

fn kind_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<NodeKind> {
    let s: String = row.get(idx)?;
    NodeKind::from_str(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown node kind: {s}").into(),
        )
    })
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<NodeSummary> {
    Ok(NodeSummary {
        id: id_column(row, 0)?,
        name: row.get(1)?,
        kind: kind_column(row, 2)?,
    })
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    let parent: Option<Vec<u8>> = row.get(3)?;
    let parent_id = match parent {
        Some(bytes) => Some(NodeId::try_from_slice(&bytes).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Blob,
                "parent id must be 16 bytes".into(),
            )
        })?),
        None => None,
    };
    Ok(Node {
        id: id_column(row, 0)?,
        name: row.get(1)?,
        kind: kind_column(row, 2)?,
        parent_id,
        content: row.get(4)?,
        created_at: row.get::<_, i64>(5)? as u64,
        updated_at: row.get::<_, i64>(6)? as u64,
    })
}
