//! # treefs-kernel
//!
//! A folder/file tree kept in a relational store.
//!
//! Nodes point at their parent by ID; absolute paths are derived, never
//! stored. The kernel:
//! - Resolves paths segment by segment, with a `(parent, name)` cache
//! - Runs every mutation as one snapshot transaction with row locks
//! - Retries conflicting transactions a bounded number of times
//! - Invalidates only the cache keys a commit actually changed
//! - Moves a subtree of any size by rewriting one row

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod integrity;
pub mod locks;
pub mod path;
pub mod repo;
pub mod resolver;
pub mod txn;

pub use cache::{CacheKey, CacheStats, CacheStore, CacheValue, ChildRef, MemoryCache, TreeCache};
pub use commands::{Command, Output, Session, split_words};
pub use config::{CacheConfig, ConfigError, TreeConfig};
pub use db::{NodeDb, NodeRows};
pub use error::{TreeError, TreeResult};
pub use integrity::Violation;
pub use locks::{LockSet, RowLocks};
pub use path::{MAX_NAME_LEN, MAX_PATH_LEN, NodePath, RelativePath, validate_name};
pub use repo::{SearchHit, SharedRepository, TreeRepository};
pub use resolver::{Resolved, Resolver};
pub use txn::{RetryPolicy, Txn, TxnController};

pub use treefs_types::{Node, NodeId, NodeKind, NodeStat, NodeSummary};
