//! [`CachedStorageManager`]: a bounded write-through LRU decorator over
//! [`crate::storage::ObjectStorageManager`].
//!
//! Grounded on `spec.md` §4.11. The teacher's own cache (`BufferPool`,
//! `src/buffer/mod.rs`) tracks recency with a monotonic access counter and
//! scans all frames to find the oldest on eviction; `spec.md` asks for an
//! explicit doubly linked list with head = oldest and a pool of recycled
//! entry nodes instead, so this module keeps the teacher's general shape
//! (a capacity-bounded map plus an eviction policy sitting in front of a
//! slower layer) but implements the list the way the spec names it: an
//! arena of nodes addressed by index, since safe Rust has no back-pointers.

use std::collections::HashMap;

use crate::error::Result;
use crate::loc::Location;
use crate::storage::{Codec, ObjectStorageManager};

const NIL: usize = usize::MAX;

struct Node<T> {
    key: Location,
    value: T,
    prev: usize,
    next: usize,
}

/// A doubly linked list of `(Location, T)` bindings, oldest at the head,
/// most recently used at the tail, built over an arena so eviction and
/// touch are O(1) without unsafe code.
struct LruList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<T> LruList<T> {
    fn new() -> LruList<T> {
        LruList {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.nodes[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev].as_mut().unwrap().next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].as_mut().unwrap().prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let node = self.nodes[idx].as_mut().unwrap();
            node.prev = old_tail;
            node.next = NIL;
        }
        if old_tail != NIL {
            self.nodes[old_tail].as_mut().unwrap().next = idx;
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }

    /// Insert a fresh binding at the tail (most recently used), recycling
    /// a freed node slot if one is available.
    fn insert(&mut self, key: Location, value: T) -> usize {
        let idx = if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(Node {
                key,
                value,
                prev: NIL,
                next: NIL,
            });
            idx
        } else {
            self.nodes.push(Some(Node {
                key,
                value,
                prev: NIL,
                next: NIL,
            }));
            self.nodes.len() - 1
        };
        self.push_tail(idx);
        idx
    }

    /// Move an existing node to the tail (most recently used position).
    fn touch(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        self.push_tail(idx);
    }

    /// Remove a node entirely, returning its slot to the free pool.
    fn remove(&mut self, idx: usize) -> T {
        self.unlink(idx);
        let node = self.nodes[idx].take().unwrap();
        self.free.push(idx);
        node.value
    }

    /// Evict and return the oldest (head) binding.
    fn pop_head(&mut self) -> Option<(Location, T)> {
        if self.head == NIL {
            return None;
        }
        let idx = self.head;
        let key = self.nodes[idx].as_ref().unwrap().key;
        let value = self.remove(idx);
        Some((key, value))
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }
}

/// Decorates [`ObjectStorageManager`] with a bounded write-through LRU of
/// `(Location, T)` bindings. Every mutating call still goes through to the
/// underlying manager first; the cache only ever saves later `Fetch`es
/// from doing I/O.
pub struct CachedStorageManager<T, C: Codec<T>> {
    inner: ObjectStorageManager<T, C>,
    list: LruList<T>,
    index: HashMap<Location, usize>,
    capacity: usize,
}

impl<T: Clone, C: Codec<T>> CachedStorageManager<T, C> {
    pub fn new(inner: ObjectStorageManager<T, C>, capacity: usize) -> CachedStorageManager<T, C> {
        assert!(capacity > 0, "cache capacity must be at least 1");
        CachedStorageManager {
            inner,
            list: LruList::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    pub fn into_inner(self) -> ObjectStorageManager<T, C> {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert (or refresh) a binding, evicting the oldest entry first if
    /// the cache is already at capacity.
    fn remember(&mut self, key: Location, value: T) {
        if let Some(&idx) = self.index.get(&key) {
            self.list.remove(idx);
            self.index.remove(&key);
        }
        if self.index.len() >= self.capacity {
            if let Some((evicted_key, _)) = self.list.pop_head() {
                self.index.remove(&evicted_key);
            }
        }
        let idx = self.list.insert(key, value);
        self.index.insert(key, idx);
    }

    fn forget(&mut self, key: Location) {
        if let Some(idx) = self.index.remove(&key) {
            self.list.remove(idx);
        }
    }

    pub fn insert(&mut self, value: &T) -> Result<Location> {
        let loc = self.inner.insert(value)?;
        self.remember(loc, value.clone());
        Ok(loc)
    }

    pub fn update(&mut self, log_loc: Location, value: &T) -> Result<()> {
        self.inner.update(log_loc, value)?;
        self.remember(log_loc, value.clone());
        Ok(())
    }

    pub fn fetch(&mut self, log_loc: Location) -> Result<T> {
        let value = self.inner.fetch(log_loc)?;
        self.remember(log_loc, value.clone());
        Ok(value)
    }

    /// Return the cached value for `log_loc` without touching storage, or
    /// `None` if it is not currently cached. On a hit, moves the binding
    /// to the most-recently-used position, same as [`Self::fetch`].
    pub fn fetch_cached(&mut self, log_loc: Location) -> Option<T> {
        let idx = *self.index.get(&log_loc)?;
        self.list.touch(idx);
        Some(self.list.nodes[idx].as_ref().unwrap().value.clone())
    }

    pub fn free(&mut self, log_loc: Location) -> Result<()> {
        self.inner.free(log_loc)?;
        self.forget(log_loc);
        Ok(())
    }

    pub fn root(&self, index: usize) -> Result<u64> {
        self.inner.root(index)
    }

    pub fn set_root(&mut self, index: usize, value: u64) -> Result<()> {
        self.inner.set_root(index, value)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    /// Rolls back the underlying manager, then drops the entire cache:
    /// any binding could now be stale (an `Insert`/`Update` since the
    /// last flush may have been undone).
    pub fn rollback(&mut self) -> Result<()> {
        self.inner.rollback()?;
        self.list.clear();
        self.index.clear();
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{StorageManager, StorageOptions};
    use std::path::Path;
    use tempfile::tempdir;

    struct Utf8Codec;

    impl Codec<String> for Utf8Codec {
        fn encode(&self, value: &String) -> Vec<u8> {
            value.as_bytes().to_vec()
        }

        fn decode(&self, bytes: &[u8]) -> Result<String> {
            String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Encoding(e.to_string()))
        }
    }

    fn test_options(dir: &Path) -> StorageOptions {
        let mut options = StorageOptions::new(dir.join("graph"));
        options.physical_record_size = 512;
        options.free_physical_record_size = 256;
        options.logical_record_size = 256;
        options.free_logical_record_size = 256;
        options.segment_size = 1024 * 1024;
        options
    }

    fn open_cached(dir: &Path, capacity: usize) -> CachedStorageManager<String, Utf8Codec> {
        let sm = StorageManager::open(test_options(dir)).unwrap();
        let osm = ObjectStorageManager::new(sm, Utf8Codec);
        CachedStorageManager::new(osm, capacity)
    }

    #[test]
    fn fetch_cached_misses_before_any_access() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        let loc = cache.insert(&"alpha".to_string()).unwrap();
        // insert already populates the cache, so evict it to test a miss.
        cache.forget(loc);
        assert_eq!(cache.fetch_cached(loc), None);
    }

    #[test]
    fn insert_populates_the_cache() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        let loc = cache.insert(&"alpha".to_string()).unwrap();
        assert_eq!(cache.fetch_cached(loc), Some("alpha".to_string()));
    }

    #[test]
    fn fetch_populates_the_cache_on_a_miss() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        let loc = cache.insert(&"alpha".to_string()).unwrap();
        cache.forget(loc);
        assert_eq!(cache.fetch_cached(loc), None);
        assert_eq!(cache.fetch(loc).unwrap(), "alpha");
        assert_eq!(cache.fetch_cached(loc), Some("alpha".to_string()));
    }

    #[test]
    fn update_refreshes_the_cached_value() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        let loc = cache.insert(&"alpha".to_string()).unwrap();
        cache.update(loc, &"beta".to_string()).unwrap();
        assert_eq!(cache.fetch_cached(loc), Some("beta".to_string()));
    }

    #[test]
    fn free_evicts_the_binding() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        let loc = cache.insert(&"alpha".to_string()).unwrap();
        cache.free(loc).unwrap();
        assert_eq!(cache.fetch_cached(loc), None);
    }

    #[test]
    fn eviction_drops_the_least_recently_used_entry() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 2);

        let a = cache.insert(&"a".to_string()).unwrap();
        let b = cache.insert(&"b".to_string()).unwrap();
        // touch `a` so `b` becomes the oldest.
        cache.fetch_cached(a);
        let c = cache.insert(&"c".to_string()).unwrap();

        assert_eq!(cache.fetch_cached(b), None);
        assert_eq!(cache.fetch_cached(a), Some("a".to_string()));
        assert_eq!(cache.fetch_cached(c), Some("c".to_string()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn rollback_drops_the_whole_cache() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 4);
        cache.insert(&"a".to_string()).unwrap();
        cache.insert(&"b".to_string()).unwrap();
        assert_eq!(cache.len(), 2);
        cache.rollback().unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn recycled_node_slots_are_reused_rather_than_growing_forever() {
        let dir = tempdir().unwrap();
        let mut cache = open_cached(dir.path(), 2);
        for i in 0..10 {
            cache.insert(&format!("v{i}")).unwrap();
        }
        // Only ever 2 live bindings, but the arena should have recycled
        // freed slots rather than holding all 10 nodes it ever allocated.
        assert!(cache.list.nodes.len() <= 4);
    }
}
