use super::engine::PersistentStore;
use crate::core::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Sorted in-memory store.
///
/// Keeps a second copy of the map as of the last `flush()`, which is what a
/// crash would leave behind. Useful for tests and for caches that never need
/// to outlive the process.
pub struct MemoryStore {
    name: String,
    /// Current contents, including unflushed writes
    live: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Contents as of the last flush
    durable: RwLock<BTreeMap<String, Vec<u8>>>,
    flushes: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            live: RwLock::new(BTreeMap::new()),
            durable: RwLock::new(BTreeMap::new()),
            flushes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Value as a crash right now would preserve it
    pub fn durable_get(&self, key: &str) -> Option<Vec<u8>> {
        self.durable.read().get(key).cloned()
    }

    pub fn durable_len(&self) -> usize {
        self.durable.read().len()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

impl PersistentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.live.read().get(key).cloned())
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        let mut live = self.live.write();
        if let Some(existing) = live.get(key) {
            return Ok(Some(existing.clone()));
        }
        live.insert(key.to_string(), value);
        Ok(None)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.live.write().insert(key.to_string(), value))
    }

    fn remove(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.live.write().remove(key))
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.check_open()?;
        Ok(self.live.read().keys().cloned().collect())
    }

    fn len(&self) -> StoreResult<usize> {
        self.check_open()?;
        Ok(self.live.read().len())
    }

    fn flush(&self) -> StoreResult<()> {
        self.check_open()?;
        let snapshot = self.live.read().clone();
        *self.durable.write() = snapshot;
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        self.check_open()?;
        self.live.write().clear();
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.flush()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
