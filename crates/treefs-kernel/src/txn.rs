//! Transaction controller.
//!
//! Every repository operation runs through [`TxnController::run`] (mutations)
//! or [`TxnController::read`] (snapshot reads). One attempt is:
//!
//! 1. check out a connection and begin an immediate transaction, queueing
//!    on the store's busy timeout behind any other writer
//! 2. run the operation body, which takes row locks before it mutates
//! 3. commit, then apply the cache invalidations the body collected, then
//!    release the row locks
//!
//! Reads use deferred transactions: the first read fixes the snapshot and
//! never waits on a writer.
//!
//! Any error rolls the attempt back and invalidates nothing. A `Conflict`
//! restarts the whole operation from scratch, including path resolution,
//! up to the configured retry bound.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Transaction, TransactionBehavior};
use treefs_types::{Node, NodeId, now_millis};

use crate::cache::{CacheKey, TreeCache};
use crate::config::TreeConfig;
use crate::db::{NodeDb, NodeRows};
use crate::error::{TreeError, TreeResult};
use crate::locks::{LockSet, RowLocks};

/// Retry and lock-wait tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one fails with a conflict.
    pub max_retries: u32,
    /// Per-row lock wait before giving up with a conflict.
    pub lock_timeout: Duration,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TreeConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TreeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            lock_timeout: config.lock_timeout(),
            backoff: config.retry_backoff(),
        }
    }
}

/// Runs operation bodies inside store transactions.
pub struct TxnController {
    db: NodeDb,
    locks: Arc<RowLocks>,
    cache: TreeCache,
    policy: RetryPolicy,
}

impl TxnController {
    pub fn new(db: NodeDb, cache: TreeCache, policy: RetryPolicy) -> Self {
        Self {
            db,
            locks: RowLocks::new(),
            cache,
            policy,
        }
    }

    pub fn cache(&self) -> &TreeCache {
        &self.cache
    }

    pub fn locks(&self) -> &RowLocks {
        &self.locks
    }

    /// Run a mutating operation, retrying on conflict.
    pub fn run<T, F>(&self, op: &'static str, mut body: F) -> TreeResult<T>
    where
        F: FnMut(&mut Txn<'_>) -> TreeResult<T>,
    {
        self.retrying(op, || self.attempt(&mut body))
    }

    /// Run a read-only body against one snapshot.
    ///
    /// The body receives the cache epoch sampled before the snapshot opened;
    /// pass it to any cache fill.
    pub fn read<T, F>(&self, op: &'static str, mut body: F) -> TreeResult<T>
    where
        F: FnMut(&NodeRows<'_>, u64) -> TreeResult<T>,
    {
        self.retrying(op, || {
            let epoch = self.cache.begin_read();
            let conn = self.db.checkout()?;
            let tx = conn.unchecked_transaction()?;
            let value = body(&NodeRows::new(&tx), epoch)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn retrying<T>(&self, op: &'static str, mut once: impl FnMut() -> TreeResult<T>) -> TreeResult<T> {
        let mut attempt = 0u32;
        loop {
            match once() {
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    tracing::warn!(op, attempt, error = %e, "conflict, retrying");
                    if !self.policy.backoff.is_zero() {
                        std::thread::sleep(self.policy.backoff);
                    }
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::warn!(op, attempts = attempt + 1, error = %e, "giving up after conflicts");
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }

    fn attempt<T, F>(&self, body: &mut F) -> TreeResult<T>
    where
        F: FnMut(&mut Txn<'_>) -> TreeResult<T>,
    {
        // Declared first so it drops last: rollback happens before unlock.
        let mut locks = self.locks.begin(self.policy.lock_timeout);
        let conn = self.db.checkout()?;
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;

        let mut txn = Txn {
            rows: NodeRows::new(&tx),
            locks: &mut locks,
            pending: Vec::new(),
            now: now_millis(),
        };
        let value = body(&mut txn)?;
        let pending = std::mem::take(&mut txn.pending);
        drop(txn);

        tx.commit()?;
        self.cache.invalidate(&pending);
        drop(locks);
        Ok(value)
    }
}

/// One attempt of a mutating operation.
///
/// Dereferences to [`NodeRows`] for reads and writes within the snapshot.
pub struct Txn<'a> {
    rows: NodeRows<'a>,
    locks: &'a mut LockSet,
    pending: Vec<CacheKey>,
    now: u64,
}

impl<'a> Txn<'a> {
    /// Timestamp shared by every write in this attempt.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn rows(&self) -> &NodeRows<'a> {
        &self.rows
    }

    /// Lock a row and re-read it. A row that vanished is a conflict.
    pub fn lock(&mut self, id: NodeId) -> TreeResult<Node> {
        self.locks.acquire(id)?;
        self.rows
            .get(id)?
            .ok_or_else(|| TreeError::conflict(format!("node {id} disappeared")))
    }

    /// Lock several rows in ascending ID order.
    pub fn lock_all(&mut self, ids: impl IntoIterator<Item = NodeId>) -> TreeResult<()> {
        self.locks.acquire_all(ids)
    }

    /// Queue a cache entry for deletion once the transaction commits.
    pub fn invalidate(&mut self, key: CacheKey) {
        if !self.pending.contains(&key) {
            self.pending.push(key);
        }
    }
}

impl<'a> std::ops::Deref for Txn<'a> {
    type Target = NodeRows<'a>;

    fn deref(&self) -> &NodeRows<'a> {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ChildRef;
    use crate::config::CacheConfig;
    use std::cell::Cell;
    use treefs_types::NodeKind;

    fn controller() -> TxnController {
        TxnController::new(
            NodeDb::in_memory().unwrap(),
            TreeCache::from_config(&CacheConfig::default()),
            RetryPolicy::default(),
        )
    }

    fn root_id(ctl: &TxnController) -> NodeId {
        ctl.read("root", |rows, _| Ok(rows.root()?.unwrap().id)).unwrap()
    }

    #[test]
    fn test_commit_persists() {
        let ctl = controller();
        let root = root_id(&ctl);
        let id = ctl
            .run("create", |txn| {
                txn.lock(root)?;
                let node = Node::folder(root, "docs");
                txn.insert(&node)?;
                Ok(node.id)
            })
            .unwrap();
        let found = ctl.read("get", |rows, _| rows.get(id)).unwrap();
        assert_eq!(found.unwrap().name, "docs");
        assert_eq!(ctl.locks().held_count(), 0);
    }

    #[test]
    fn test_error_rolls_back_and_skips_invalidation() {
        let ctl = controller();
        let root = root_id(&ctl);
        let epoch = ctl.cache().begin_read();
        let child = ChildRef {
            id: NodeId::new(),
            kind: NodeKind::Folder,
        };
        ctl.cache().fill_child(epoch, root, "docs", child);

        let result: TreeResult<()> = ctl.run("create", |txn| {
            txn.insert(&Node::folder(root, "docs"))?;
            txn.invalidate(CacheKey::child(root, "docs"));
            Err(TreeError::invalid("abort"))
        });
        assert!(matches!(result, Err(TreeError::InvalidArgument(_))));

        let count = ctl.read("count", |rows, _| rows.count()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(ctl.cache().child(root, "docs"), Some(child));
        assert_eq!(ctl.locks().held_count(), 0);
    }

    #[test]
    fn test_invalidation_applied_after_commit() {
        let ctl = controller();
        let root = root_id(&ctl);
        let epoch = ctl.cache().begin_read();
        ctl.cache().fill_children(epoch, root, Arc::new(Vec::new()));

        ctl.run("create", |txn| {
            txn.insert(&Node::folder(root, "docs"))?;
            txn.invalidate(CacheKey::Children(root));
            Ok(())
        })
        .unwrap();
        assert!(ctl.cache().children(root).is_none());
    }

    #[test]
    fn test_conflict_is_retried() {
        let ctl = controller();
        let attempts = Cell::new(0);
        let value = ctl
            .run("flaky", |_txn| {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 3 {
                    Err(TreeError::conflict("busy"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_retry_bound_surfaces_conflict() {
        let ctl = controller();
        let attempts = Cell::new(0);
        let result: TreeResult<()> = ctl.run("always", |_txn| {
            attempts.set(attempts.get() + 1);
            Err(TreeError::conflict("busy"))
        });
        assert!(matches!(result, Err(TreeError::Conflict(_))));
        assert_eq!(attempts.get(), 1 + RetryPolicy::default().max_retries);
    }

    #[test]
    fn test_non_conflict_errors_not_retried() {
        let ctl = controller();
        let attempts = Cell::new(0);
        let result: TreeResult<()> = ctl.run("missing", |_txn| {
            attempts.set(attempts.get() + 1);
            Err(TreeError::not_found("/x"))
        });
        assert!(matches!(result, Err(TreeError::NotFound(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_lock_of_missing_row_is_conflict() {
        let ctl = TxnController::new(
            NodeDb::in_memory().unwrap(),
            TreeCache::from_config(&CacheConfig::default()),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        );
        let result = ctl.run("lock", |txn| txn.lock(NodeId::new()));
        assert!(matches!(result, Err(TreeError::Conflict(_))));
    }
}
