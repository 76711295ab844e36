//! Interning stores for the pipeline's long-lived entities.
//!
//! Each store maps a lookup key to exactly one owned entity and hands out
//! `Arc` handles; all later inserts with the same key return the first
//! allocation. Insert traffic is high during ingest, so the map is sharded.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A keyed interning store.
pub struct UniquedSet<K: Eq + Hash, T> {
    map: DashMap<K, Arc<T>>,
}

impl<K: Eq + Hash, T> Default for UniquedSet<K, T> {
    fn default() -> Self {
        UniquedSet { map: DashMap::new() }
    }
}

impl<K: Eq + Hash + Clone, T> UniquedSet<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entity for `key`. The bool is true exactly once per
    /// key, for the caller whose construction won.
    pub fn ensure(&self, key: K, make: impl FnOnce() -> T) -> (Arc<T>, bool) {
        match self.map.entry(key) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(v) => {
                let val = Arc::new(make());
                v.insert(val.clone());
                (val, true)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        self.map.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of the current contents. Order is unspecified.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }
}

/// An append-only list of owned entities, for the non-interned stores.
pub struct Registry<T> {
    items: RwLock<Vec<Arc<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry { items: RwLock::new(Vec::new()) }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: Arc<T>) {
        self.items.write().expect("registry poisoned").push(item);
    }

    pub fn len(&self) -> usize {
        self.items.read().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.read().expect("registry poisoned").clone()
    }
}
