//! Resolution cache.
//!
//! Two kinds of entries speed up path walks and listings:
//!
//! - `Child { parent, name }` → the child's ID and kind
//! - `Children(folder)` → the folder's full listing
//!
//! The store is always authoritative. Entries are only filled from
//! committed snapshots and are deleted after every commit that could make
//! them wrong. A TTL bounds staleness if an invalidation is ever lost.
//!
//! Fills race with invalidations: a reader that sampled the store before a
//! writer committed could otherwise write its now-stale result back after
//! the writer's delete. [`TreeCache`] keeps an epoch that every
//! invalidation bumps; a fill whose epoch is behind removes what it just
//! wrote.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use treefs_types::{NodeId, NodeKind, NodeSummary};

use crate::config::CacheConfig;

/// Cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// One named child of a folder.
    Child { parent: NodeId, name: String },
    /// The full listing of a folder.
    Children(NodeId),
}

impl CacheKey {
    pub fn child(parent: NodeId, name: impl Into<String>) -> Self {
        Self::Child {
            parent,
            name: name.into(),
        }
    }
}

/// What a `Child` entry resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildRef {
    pub id: NodeId,
    pub kind: NodeKind,
}

/// Cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValue {
    Child(ChildRef),
    Children(Arc<Vec<NodeSummary>>),
}

/// Key-value cache with per-entry expiry.
///
/// This is the seam for swapping in an external cache. Implementations
/// must be safe to share across threads.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CacheValue>;
    fn set(&self, key: CacheKey, value: CacheValue, ttl: Option<Duration>);
    fn delete(&self, key: &CacheKey);

    /// Counters, for stores that keep them.
    fn stats(&self) -> Option<CacheStats> {
        None
    }
}

struct Entry {
    value: CacheValue,
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.is_none_or(|at| at > now)
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// In-process cache over a concurrent map.
pub struct MemoryCache {
    entries: DashMap<CacheKey, Entry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make room for one more entry: expired entries first, then whatever
    /// the map yields.
    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
        let excess = (self.entries.len() + 1).saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let victims: Vec<CacheKey> = self
            .entries
            .iter()
            .take(excess)
            .map(|e| e.key().clone())
            .collect();
        for key in victims {
            self.entries.remove(&key);
        }
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CacheValue> {
        let now = Instant::now();
        // The read guard must be released before touching the same shard again.
        let found = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn set(&self, key: CacheKey, value: CacheValue, ttl: Option<Duration>) {
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(key, Entry { value, expires });
    }

    fn delete(&self, key: &CacheKey) {
        self.entries.remove(key);
    }

    fn stats(&self) -> Option<CacheStats> {
        Some(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        })
    }
}

/// Typed, epoch-guarded view over a [`CacheStore`].
pub struct TreeCache {
    store: Box<dyn CacheStore>,
    ttl: Option<Duration>,
    epoch: AtomicU64,
}

impl TreeCache {
    pub fn new(store: Box<dyn CacheStore>, ttl: Option<Duration>) -> Self {
        Self {
            store,
            ttl,
            epoch: AtomicU64::new(0),
        }
    }

    /// In-process cache sized by `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Box::new(MemoryCache::new(config.max_entries)), config.ttl())
    }

    /// Sample the epoch. Call before opening the snapshot that fills use.
    pub fn begin_read(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<ChildRef> {
        match self.store.get(&CacheKey::child(parent, name))? {
            CacheValue::Child(child) => Some(child),
            CacheValue::Children(_) => None,
        }
    }

    pub fn children(&self, folder: NodeId) -> Option<Arc<Vec<NodeSummary>>> {
        match self.store.get(&CacheKey::Children(folder))? {
            CacheValue::Children(list) => Some(list),
            CacheValue::Child(_) => None,
        }
    }

    pub fn fill_child(&self, epoch: u64, parent: NodeId, name: &str, child: ChildRef) {
        self.fill(epoch, CacheKey::child(parent, name), CacheValue::Child(child));
    }

    pub fn fill_children(&self, epoch: u64, folder: NodeId, list: Arc<Vec<NodeSummary>>) {
        self.fill(epoch, CacheKey::Children(folder), CacheValue::Children(list));
    }

    fn fill(&self, epoch: u64, key: CacheKey, value: CacheValue) {
        if self.epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        self.store.set(key.clone(), value, self.ttl);
        // An invalidation may have landed between the check and the set.
        if self.epoch.load(Ordering::Acquire) != epoch {
            self.store.delete(&key);
        }
    }

    pub fn stats(&self) -> Option<CacheStats> {
        self.store.stats()
    }

    /// Drop one entry without bumping the epoch (stale entry seen by a reader).
    pub fn evict(&self, key: &CacheKey) {
        self.store.delete(key);
    }

    /// Delete entries after a commit.
    pub fn invalidate(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for key in keys {
            self.store.delete(key);
        }
        tracing::trace!(count = keys.len(), "invalidated cache entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(name: &str) -> NodeSummary {
        NodeSummary {
            id: NodeId::new(),
            name: name.to_string(),
            kind: NodeKind::File,
        }
    }

    #[test]
    fn test_memory_cache_get_set_delete() {
        let cache = MemoryCache::new(16);
        let key = CacheKey::Children(NodeId::new());
        assert!(cache.get(&key).is_none());

        let value = CacheValue::Children(Arc::new(vec![summary("a")]));
        cache.set(key.clone(), value.clone(), None);
        assert_eq!(cache.get(&key), Some(value));

        cache.delete(&key);
        assert!(cache.get(&key).is_none());
        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_memory_cache_expiry() {
        let cache = MemoryCache::new(16);
        let key = CacheKey::child(NodeId::new(), "x");
        let value = CacheValue::Child(ChildRef {
            id: NodeId::new(),
            kind: NodeKind::Folder,
        });
        cache.set(key.clone(), value, Some(Duration::ZERO));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_memory_cache_bounded() {
        let cache = MemoryCache::new(4);
        for i in 0..20 {
            cache.set(
                CacheKey::child(NodeId::new(), format!("n{i}")),
                CacheValue::Children(Arc::new(Vec::new())),
                None,
            );
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_fill_after_invalidate_is_dropped() {
        let cache = TreeCache::from_config(&CacheConfig::default());
        let folder = NodeId::new();

        let stale_epoch = cache.begin_read();
        cache.invalidate(&[CacheKey::Children(folder)]);
        cache.fill_children(stale_epoch, folder, Arc::new(vec![summary("ghost")]));
        assert!(cache.children(folder).is_none());

        let epoch = cache.begin_read();
        cache.fill_children(epoch, folder, Arc::new(vec![summary("real")]));
        assert_eq!(cache.children(folder).unwrap()[0].name, "real");
    }

    #[test]
    fn test_child_and_children_keys_are_distinct() {
        let cache = TreeCache::from_config(&CacheConfig::default());
        let parent = NodeId::new();
        let child = ChildRef {
            id: NodeId::new(),
            kind: NodeKind::File,
        };
        let epoch = cache.begin_read();
        cache.fill_child(epoch, parent, "f", child);
        assert_eq!(cache.child(parent, "f"), Some(child));
        assert!(cache.child(parent, "g").is_none());
        assert!(cache.children(parent).is_none());

        cache.invalidate(&[CacheKey::child(parent, "f")]);
        assert!(cache.child(parent, "f").is_none());
    }
}
