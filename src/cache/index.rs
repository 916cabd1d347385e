use super::entry::{Acquire, Entry};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of trying to admit a value for a key.
pub enum Admission<V> {
    /// A live entry already existed; the candidate was discarded
    Existing(Arc<Entry<V>>, Arc<V>),
    /// The candidate is now the live instance
    Inserted(Arc<Entry<V>>, Arc<V>),
    /// The current entry is mid page-out; wait on it and retry
    Busy(Arc<Entry<V>>),
}

/// Concurrent key -> Entry map: the authoritative view of what is hot.
///
/// Every `Entry` handed out by `admit` already counts the caller as a holder.
pub struct MemoryIndex<V> {
    map: DashMap<String, Arc<Entry<V>>>,
    generations: AtomicU64,
}

impl<V> MemoryIndex<V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Entry<V>>> {
        self.map.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn admit(&self, key: &str, candidate: Arc<V>) -> Admission<V> {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let current = Arc::clone(occupied.get());
                match current.acquire() {
                    Acquire::Acquired(value) => Admission::Existing(current, value),
                    Acquire::Expunging => Admission::Busy(current),
                    Acquire::Cleared => {
                        // finished page-out whose removal has not landed yet
                        let fresh = self.fresh_entry(key, &candidate);
                        occupied.insert(Arc::clone(&fresh));
                        Admission::Inserted(fresh, candidate)
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                let fresh = self.fresh_entry(key, &candidate);
                vacant.insert(Arc::clone(&fresh));
                Admission::Inserted(fresh, candidate)
            }
        }
    }

    /// Removes `key` only if it still maps to this exact entry.
    pub fn remove_if_same(&self, key: &str, entry: &Arc<Entry<V>>) -> bool {
        self.map
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn entries(&self) -> Vec<Arc<Entry<V>>> {
        self.map.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.map.clear();
    }

    fn fresh_entry(&self, key: &str, value: &Arc<V>) -> Arc<Entry<V>> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(Entry::new(key, Arc::clone(value), generation, true))
    }
}

impl<V> Default for MemoryIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}
