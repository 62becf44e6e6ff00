//! Row-level exclusive locks.
//!
//! SQLite has no `SELECT ... FOR UPDATE`, so mutating transactions take
//! in-process locks on the node IDs they are about to touch. Locks are
//! exclusive, reentrant within one [`LockSet`], and released together when
//! the set is dropped (after commit or rollback).
//!
//! Waiting is bounded: a lock that cannot be had before the deadline turns
//! into a [`TreeError::Conflict`], which the transaction controller retries.
//! Callers that know their full lock set up front use
//! [`LockSet::acquire_all`], which takes locks in ascending ID order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use treefs_types::NodeId;

use crate::error::{TreeError, TreeResult};

/// Owner of a set of held locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner(u64);

/// Lock table shared by every transaction on one repository.
#[derive(Debug, Default)]
pub struct RowLocks {
    held: Mutex<HashMap<NodeId, Owner>>,
    released: Condvar,
    next_owner: AtomicU64,
}

impl RowLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start an empty lock set that waits at most `timeout` per lock.
    pub fn begin(self: &Arc<Self>, timeout: Duration) -> LockSet {
        LockSet {
            table: Arc::clone(self),
            owner: Owner(self.next_owner.fetch_add(1, Ordering::Relaxed)),
            held: Vec::new(),
            timeout,
        }
    }

    /// Number of locked rows across all owners.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn acquire(&self, id: NodeId, owner: Owner, deadline: Instant) -> TreeResult<bool> {
        let mut held = self.held.lock();
        loop {
            match held.get(&id) {
                None => {
                    held.insert(id, owner);
                    return Ok(true);
                }
                Some(current) if *current == owner => return Ok(false),
                Some(_) => {
                    if self.released.wait_until(&mut held, deadline).timed_out()
                        && held.get(&id).is_some_and(|o| *o != owner)
                    {
                        return Err(TreeError::conflict(format!(
                            "timed out waiting for lock on node {id}"
                        )));
                    }
                }
            }
        }
    }

    fn release(&self, ids: &[NodeId], owner: Owner) {
        if ids.is_empty() {
            return;
        }
        let mut held = self.held.lock();
        for id in ids {
            if held.get(id) == Some(&owner) {
                held.remove(id);
            }
        }
        drop(held);
        self.released.notify_all();
    }
}

/// Locks held by one transaction attempt.
#[derive(Debug)]
pub struct LockSet {
    table: Arc<RowLocks>,
    owner: Owner,
    held: Vec<NodeId>,
    timeout: Duration,
}

impl LockSet {
    /// Lock one row, waiting up to the set's timeout. Reentrant.
    pub fn acquire(&mut self, id: NodeId) -> TreeResult<()> {
        let deadline = Instant::now() + self.timeout;
        if self.table.acquire(id, self.owner, deadline)? {
            self.held.push(id);
        }
        Ok(())
    }

    /// Lock several rows in ascending ID order.
    pub fn acquire_all(&mut self, ids: impl IntoIterator<Item = NodeId>) -> TreeResult<()> {
        let mut ids: Vec<NodeId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            self.acquire(id)?;
        }
        Ok(())
    }

    pub fn holds(&self, id: NodeId) -> bool {
        self.held.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Release everything now rather than at drop.
    pub fn release_all(&mut self) {
        let ids = std::mem::take(&mut self.held);
        self.table.release(&ids, self.owner);
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}
