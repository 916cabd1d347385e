#![allow(dead_code)]

use oicache::{
    CacheConfig, CacheLink, IdentityCache, IdentityCacheable, MemoryStore, PersistentStore,
    ReclamationStrategy, StoreError, StoreResult,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Mutable per-key value used across the integration tests.
#[derive(Debug, Serialize, Deserialize)]
pub struct Counter {
    key: String,
    value: AtomicU64,
    #[serde(skip)]
    link: CacheLink,
}

impl Counter {
    pub fn new(key: &str) -> Self {
        Self::with_value(key, 0)
    }

    pub fn with_value(key: &str, value: u64) -> Self {
        Self {
            key: key.to_string(),
            value: AtomicU64::new(value),
            link: CacheLink::new(),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Mutates and marks dirty, the way crawl state objects do.
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
        self.make_dirty().unwrap();
    }

    pub fn increment(&self) -> u64 {
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        self.make_dirty().unwrap();
        value
    }
}

impl IdentityCacheable for Counter {
    fn key(&self) -> &str {
        &self.key
    }

    fn cache_link(&self) -> &CacheLink {
        &self.link
    }
}

pub fn decode(bytes: &[u8]) -> Counter {
    rmp_serde::from_slice(bytes).unwrap()
}

/// Counter value as currently held by the store.
pub fn stored_value(store: &dyn PersistentStore, key: &str) -> Option<u64> {
    store.get(key).unwrap().map(|bytes| decode(&bytes).get())
}

pub fn config(strategy: ReclamationStrategy) -> CacheConfig {
    CacheConfig::new("counters").strategy(strategy)
}

pub fn open_memory(config: CacheConfig) -> (Arc<MemoryStore>, IdentityCache<Counter>) {
    let store = Arc::new(MemoryStore::new(&config.name));
    let cache = IdentityCache::open(store.clone(), config).unwrap();
    (store, cache)
}

/// Store that answers the first `failures` calls of each write with contention.
pub struct FlakyStore {
    inner: MemoryStore,
    remaining: AtomicUsize,
    calls: AtomicUsize,
    broken: AtomicBool,
}

impl FlakyStore {
    pub fn new(name: &str, failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(name),
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
        }
    }

    /// Every later write fails with an I/O error.
    pub fn break_writes(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Makes the next `n` writes contend.
    pub fn fail_next(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn contend(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Io("no space left on device".into()));
        }
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Contention("lock timeout".into()))
        } else {
            Ok(())
        }
    }
}

impl PersistentStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.contend()?;
        self.inner.put_if_absent(key, value)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.contend()?;
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.inner.keys()
    }

    fn len(&self) -> StoreResult<usize> {
        self.inner.len()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }

    fn clear(&self) -> StoreResult<()> {
        self.inner.clear()
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}

/// Store whose `put` blocks while the gate is closed, so a page-out can be
/// held mid-flight.
pub struct GatedStore {
    inner: MemoryStore,
    closed: Mutex<bool>,
    opened: Condvar,
    blocked_puts: AtomicUsize,
    puts: AtomicU64,
    armed: AtomicBool,
}

impl GatedStore {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryStore::new(name),
            closed: Mutex::new(false),
            opened: Condvar::new(),
            blocked_puts: AtomicUsize::new(0),
            puts: AtomicU64::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// Next puts block until `open_gate`.
    pub fn close_gate(&self) {
        *self.closed.lock() = true;
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        *self.closed.lock() = false;
        self.opened.notify_all();
    }

    /// Spins until a put is parked at the gate.
    pub fn wait_for_blocked_put(&self) {
        while self.blocked_puts.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl PersistentStore for GatedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        self.inner.put_if_absent(key, value)
    }

    fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>> {
        if self.armed.load(Ordering::SeqCst) {
            let mut closed = self.closed.lock();
            if *closed {
                self.blocked_puts.fetch_add(1, Ordering::SeqCst);
                while *closed {
                    self.opened.wait(&mut closed);
                }
                self.blocked_puts.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.remove(key)
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.inner.keys()
    }

    fn len(&self) -> StoreResult<usize> {
        self.inner.len()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }

    fn clear(&self) -> StoreResult<()> {
        self.inner.clear()
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}

/// Installs a test subscriber honouring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
