//! Identity-preserving write-back cache.
//!
//! At most one instance per key is live in memory. Callers share that
//! instance through `CacheRef`s; when nobody references it any more it
//! becomes idle and is eventually paged out to the backing store, from
//! where a later lookup promotes a fresh instance.
//!
//! Locking, outermost first:
//! - `gate`: read for every per-key operation, write for `sync`/`close`
//! - `drain_lock`: one drain pass at a time
//! - admission stripe for the key being admitted
//! - per-entry state and write locks
//!
//! Suppliers passed to `get_or_create` run under the gate and must not call
//! back into the same cache.

use crate::cache::backing::BackingStore;
use crate::cache::config::{CacheConfig, ReclamationStrategy};
use crate::cache::entry::{Acquire, AwaitOutcome, Entry, ExpungeStart};
use crate::cache::handle::CacheRef;
use crate::cache::index::{Admission, MemoryIndex};
use crate::cache::reclaim::{self, PressureCanary, ReclamationNotifier};
use crate::cache::stats::{CacheStats, Counters, DrainReport, Gauges, PageOutOutcome};
use crate::cache::worker::{Drainable, PageOutWorker, spawn_page_out_worker};
use crate::core::{CacheError, DirtySink, IdentityCacheable, Result};
use crate::storage::PersistentStore;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct IdentityCache<V: IdentityCacheable> {
    inner: Arc<CacheInner<V>>,
}

impl<V: IdentityCacheable> Clone for IdentityCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<V: IdentityCacheable> {
    name: String,
    config: CacheConfig,
    index: MemoryIndex<V>,
    backing: BackingStore<V>,
    notifier: Arc<dyn ReclamationNotifier<V>>,
    canary: PressureCanary,
    stripes: Box<[Mutex<()>]>,
    gate: RwLock<()>,
    drain_lock: Mutex<()>,
    open: AtomicBool,
    /// Set by a fatal store error; the cache then only accepts `close`
    poisoned: AtomicBool,
    counters: Counters,
    this: Weak<CacheInner<V>>,
}

impl<V: IdentityCacheable> IdentityCache<V> {
    /// Opens a cache over `store`. Existing keys in the store stay there and
    /// are promoted on first access.
    pub fn open(store: Arc<dyn PersistentStore>, config: CacheConfig) -> Result<Self> {
        config.validate().map_err(CacheError::Config)?;
        let notifier = reclaim::notifier_for::<V>(&config).map_err(CacheError::Config)?;
        let backing = BackingStore::new(store, config.retry.clone());
        let stripes = (0..config.admission_stripes)
            .map(|_| Mutex::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new_cyclic(|this| CacheInner {
            name: config.name.clone(),
            canary: PressureCanary::new(config.max_hot_entries),
            config,
            index: MemoryIndex::new(),
            backing,
            notifier,
            stripes,
            gate: RwLock::new(()),
            drain_lock: Mutex::new(()),
            open: AtomicBool::new(true),
            poisoned: AtomicBool::new(false),
            counters: Counters::default(),
            this: Weak::clone(this),
        });
        info!(
            cache = %inner.name,
            store = inner.backing.name(),
            strategy = ?inner.config.strategy,
            "opened identity cache"
        );
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn strategy(&self) -> ReclamationStrategy {
        self.inner.config.strategy
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Live instance for `key`, promoting it from the store if needed.
    /// Never creates.
    pub fn get(&self, key: &str) -> Result<Option<CacheRef<V>>> {
        self.inner.load(key, None::<fn() -> V>)
    }

    /// Live instance for `key`; promotes from the store, or else runs
    /// `supplier` (at most once per key) and stores the result.
    pub fn get_or_create<F>(&self, key: &str, supplier: F) -> Result<CacheRef<V>>
    where
        F: FnOnce() -> V,
    {
        self.inner
            .load(key, Some(supplier))?
            .ok_or_else(|| CacheError::Closed(format!("{}: no value produced for '{}'", self.inner.name, key)))
    }

    /// Records that the live value for `key` was mutated.
    pub fn dirty_key(&self, key: &str) -> Result<()> {
        self.inner.mark_dirty(key)
    }

    /// Writes every live entry back and flushes the store. Blocks all other
    /// callers while it runs.
    pub fn sync(&self) -> Result<()> {
        let _gate = self.inner.gate.write();
        self.inner.ensure_open()?;
        self.inner.sync_locked()
    }

    /// Syncs, then releases the store. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Number of keys ever committed to the store.
    pub fn size(&self) -> Result<usize> {
        if !self.inner.is_open() {
            return Ok(0);
        }
        self.inner.guard(self.inner.backing.len())
    }

    /// Every key in the store, ascending.
    pub fn key_set(&self) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        self.inner.guard(self.inner.backing.keys())
    }

    /// Entries currently in memory, held or idle.
    pub fn hot_len(&self) -> usize {
        self.inner.index.len()
    }

    /// Runs the page-out protocol for `key` on this thread.
    pub fn page_out(&self, key: &str) -> Result<PageOutOutcome> {
        let inner = &self.inner;
        let _gate = inner.gate.read();
        inner.ensure_open()?;
        match inner.index.lookup(key) {
            Some(entry) => inner.page_out_entry(&entry),
            None => Ok(PageOutOutcome::NotHot),
        }
    }

    /// Queues `key` for the next drain pass. False when it is not in memory.
    pub fn request_page_out(&self, key: &str) -> Result<bool> {
        self.inner.ensure_open()?;
        match self.inner.index.lookup(key) {
            Some(entry) => {
                self.inner.notifier.request(entry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One drain pass over the reclaim queue.
    pub fn drain(&self) -> Result<DrainReport> {
        let inner = &self.inner;
        let _gate = inner.gate.read();
        inner.ensure_open()?;
        let _drain = inner.drain_lock.lock();
        Ok(inner.drain_locked())
    }

    /// Background worker draining this cache every `worker_interval`.
    pub fn spawn_worker(&self) -> Result<PageOutWorker> {
        spawn_page_out_worker(self.clone(), self.inner.config.worker_interval)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.stats()
    }
}

impl<V: IdentityCacheable> Drainable for IdentityCache<V> {
    fn label(&self) -> &str {
        self.name()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn drain(&self) -> Result<DrainReport> {
        IdentityCache::drain(self)
    }
}

impl<V: IdentityCacheable> CacheInner<V> {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.poisoned.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CacheError::Closed(self.name.clone()))
        }
    }

    fn sink(&self) -> Weak<dyn DirtySink> {
        Weak::clone(&self.this) as Weak<dyn DirtySink>
    }

    fn handle(&self, value: Arc<V>, entry: Arc<Entry<V>>) -> CacheRef<V> {
        CacheRef::new(value, entry, Arc::downgrade(&self.notifier))
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let slot = (hasher.finish() % self.stripes.len() as u64) as usize;
        &self.stripes[slot]
    }

    fn load<F>(&self, key: &str, supplier: Option<F>) -> Result<Option<CacheRef<V>>>
    where
        F: FnOnce() -> V,
    {
        let _gate = self.gate.read();
        self.ensure_open()?;
        self.count_get();

        if let Some(entry) = self.index.lookup(key) {
            if let Acquire::Acquired(value) = entry.acquire() {
                Counters::bump(&self.counters.memory_hits);
                return Ok(Some(self.handle(value, entry)));
            }
        }

        self.try_drain();

        let _stripe = self.stripe(key).lock();
        let mut supplier = supplier;
        loop {
            if let Some(entry) = self.index.lookup(key) {
                match entry.acquire() {
                    Acquire::Acquired(value) => {
                        Counters::bump(&self.counters.memory_hits);
                        return Ok(Some(self.handle(value, entry)));
                    }
                    Acquire::Expunging => {
                        self.await_page_out(key, &entry)?;
                        continue;
                    }
                    Acquire::Cleared => {}
                }
            }

            let value = match self.guard(self.backing.get(key))? {
                Some(stored) => {
                    Counters::bump(&self.counters.disk_hits);
                    stored
                }
                None => {
                    let Some(create) = supplier.take() else {
                        return Ok(None);
                    };
                    Counters::bump(&self.counters.supplier_uses);
                    let created = create();
                    match self.guard(self.backing.put_if_absent(key, &created))? {
                        None => created,
                        Some(stored) => {
                            debug!(cache = %self.name, key, "store already held key, created value discarded");
                            stored
                        }
                    }
                }
            };

            match self.index.admit(key, Arc::new(value)) {
                Admission::Existing(entry, value) => return Ok(Some(self.handle(value, entry))),
                Admission::Inserted(entry, value) => {
                    value.set_identity_cache(self.sink());
                    return Ok(Some(self.handle(value, entry)));
                }
                Admission::Busy(entry) => self.await_page_out(key, &entry)?,
            }
        }
    }

    /// Waits for another thread's page-out of `entry`.
    ///
    /// On timeout the call only proceeds if the stuck entry has left the
    /// index in the meantime.
    fn await_page_out(&self, key: &str, entry: &Arc<Entry<V>>) -> Result<()> {
        match entry.await_expunge(self.config.expunge_wait) {
            AwaitOutcome::Completed => Ok(()),
            AwaitOutcome::TimedOut => {
                Counters::bump(&self.counters.await_timeouts);
                let waited_ms = u64::try_from(self.config.expunge_wait.as_millis()).unwrap_or(u64::MAX);
                let stuck = self
                    .index
                    .lookup(key)
                    .is_some_and(|current| Arc::ptr_eq(&current, entry));
                warn!(cache = %self.name, key, waited_ms, stuck, "page-out still in flight after wait window");
                if stuck {
                    Err(CacheError::AwaitTimeout {
                        key: key.to_string(),
                        waited_ms,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }

    fn count_get(&self) {
        let gets = Counters::bump(&self.counters.gets);
        let every = self.config.summary_every;
        if every > 0 && gets % every == 0 {
            debug!(cache = %self.name, "{}", self.stats().summary());
        }
    }

    fn mark_dirty(&self, key: &str) -> Result<()> {
        let _gate = self.gate.read();
        self.ensure_open()?;
        if self.notifier.strategy() == ReclamationStrategy::Automatic {
            return Ok(());
        }
        let Some(entry) = self.index.lookup(key) else {
            debug!(cache = %self.name, key, "dirty mark for key not in memory ignored");
            return Ok(());
        };
        if !entry.is_live() {
            return Ok(());
        }
        let due = self.notifier.on_dirty(&entry);
        self.write_through_all(due).1
    }

    /// Marks the cache unusable after a store error it cannot recover from.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.poisoned.swap(true, Ordering::SeqCst) {
                error!(cache = %self.name, "store failed, cache refuses further calls: {}", err);
            }
        }
        result
    }

    fn write_back(&self, entry: &Entry<V>) -> Result<bool> {
        self.guard(entry.write_back(|value| self.backing.put(entry.key(), value)))
    }

    fn write_back_if_dirty(&self, entry: &Entry<V>) -> Result<bool> {
        self.guard(entry.write_back_if_dirty(|value| self.backing.put(entry.key(), value)))
    }

    /// Writes each entry through, continuing past failures.
    /// Returns how many were written and the first error.
    fn write_through_all(&self, entries: Vec<Arc<Entry<V>>>) -> (usize, Result<()>) {
        let mut written = 0;
        let mut first_err = None;
        for entry in entries {
            match self.write_back(&entry) {
                Ok(true) => {
                    written += 1;
                    Counters::bump(&self.counters.write_throughs);
                }
                Ok(false) => {}
                Err(err) => {
                    Counters::bump(&self.counters.write_through_failures);
                    error!(cache = %self.name, key = entry.key(), "write-through failed: {}", err);
                    first_err.get_or_insert(err);
                }
            }
        }
        (written, first_err.map_or(Ok(()), Err))
    }

    fn try_drain(&self) {
        if let Some(_drain) = self.drain_lock.try_lock() {
            self.drain_locked();
        }
    }

    /// Caller holds the gate (read) and the drain lock.
    fn drain_locked(&self) -> DrainReport {
        let mut report = DrainReport::default();

        let hot = self.index.len();
        if self.canary.check(hot) {
            let moved = self.notifier.on_pressure();
            report.canary_fired = true;
            debug!(cache = %self.name, hot, moved, "pressure canary fired");
        }

        let (written, result) = self.write_through_all(self.notifier.expire_dirty());
        report.write_throughs += written;
        if result.is_err() {
            report.failed += 1;
        }

        let budget = self.notifier.pending();
        for _ in 0..budget {
            let Some(entry) = self.notifier.poll() else {
                break;
            };
            match self.page_out_entry(&entry) {
                Ok(outcome) => report.record(outcome),
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Page-out protocol for one entry: claim, persist, remove, release.
    fn page_out_entry(&self, entry: &Arc<Entry<V>>) -> Result<PageOutOutcome> {
        match entry.start_expunge() {
            ExpungeStart::NotApplicable(reason) => Ok(PageOutOutcome::NotApplicable(reason)),
            ExpungeStart::Anomaly => {
                Counters::bump(&self.counters.anomalies);
                warn!(cache = %self.name, key = entry.key(), "page-out found no value; treating as complete");
                self.complete_page_out(entry);
                Ok(PageOutOutcome::Anomaly)
            }
            ExpungeStart::Started(_) => {
                let written = match self.notifier.strategy() {
                    ReclamationStrategy::Automatic => self.write_back(entry),
                    ReclamationStrategy::Manual => {
                        self.notifier.clear_dirty(entry);
                        self.write_back_if_dirty(entry)
                    }
                };
                let persisted = match written {
                    Ok(persisted) => persisted,
                    Err(err) => {
                        self.fail_page_out(entry, &err);
                        return Err(err);
                    }
                };
                if persisted {
                    Counters::bump(&self.counters.page_out_puts);
                }
                self.complete_page_out(entry);
                Ok(PageOutOutcome::PagedOut { persisted })
            }
        }
    }

    /// Puts an entry whose write failed back into rotation, still dirty.
    fn fail_page_out(&self, entry: &Arc<Entry<V>>, err: &CacheError) {
        Counters::bump(&self.counters.page_out_failures);
        error!(cache = %self.name, key = entry.key(), "page-out failed, entry stays in memory: {}", err);
        entry.abort_expunge();
        if self.notifier.strategy() == ReclamationStrategy::Manual {
            let displaced = self.notifier.on_dirty(entry);
            let (_, result) = self.write_through_all(displaced);
            if let Err(displaced_err) = result {
                warn!(cache = %self.name, key = entry.key(), "write-through displaced by failed page-out also failed: {}", displaced_err);
            }
        }
        self.notifier.on_idle(entry);
    }

    fn complete_page_out(&self, entry: &Arc<Entry<V>>) {
        self.index.remove_if_same(entry.key(), entry);
        entry.finish_expunge();
        self.notifier.forget(entry);
        Counters::bump(&self.counters.page_outs);
    }

    /// Caller holds the gate for writing.
    fn sync_locked(&self) -> Result<()> {
        let started = Instant::now();
        let entries = self.index.entries();
        debug!(
            cache = %self.name,
            hot = entries.len(),
            dirty = self.notifier.dirty_len(),
            "sync started"
        );

        let mut written = 0usize;
        let mut first_err = None;
        for entry in &entries {
            match self.write_back(entry) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(cache = %self.name, key = entry.key(), "sync write failed: {}", err);
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        self.notifier.drain_dirty();
        self.guard(self.backing.flush())?;
        Counters::bump(&self.counters.syncs);
        debug!(
            cache = %self.name,
            written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _gate = self.gate.write();
        if !self.open.load(Ordering::SeqCst) {
            return Ok(());
        }
        let synced = if self.poisoned.load(Ordering::SeqCst) {
            warn!(cache = %self.name, "closing after store failure; live values not written");
            Ok(())
        } else {
            self.sync_locked()
        };
        if let Err(err) = &synced {
            error!(cache = %self.name, "sync during close failed: {}", err);
        }
        self.open.store(false, Ordering::SeqCst);

        self.index.clear();
        self.notifier.on_pressure();
        while self.notifier.poll().is_some() {}

        let closed = self.backing.close();
        info!(cache = %self.name, "closed identity cache");
        synced.and(closed)
    }

    fn stats(&self) -> CacheStats {
        CacheStats::capture(
            &self.name,
            &self.counters,
            Gauges {
                contention_retries: self.backing.retries(),
                canary_firings: self.canary.firings(),
                hot_entries: self.index.len(),
                idle_entries: self.notifier.idle_len(),
                pending_page_outs: self.notifier.pending(),
                dirty_entries: self.notifier.dirty_len(),
            },
        )
    }
}

impl<V: IdentityCacheable> DirtySink for CacheInner<V> {
    fn dirty_key(&self, key: &str) -> Result<()> {
        self.mark_dirty(key)
    }
}

impl<V: IdentityCacheable> Drop for CacheInner<V> {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) {
            warn!(cache = %self.name, "identity cache dropped without close; closing now");
            if let Err(err) = self.close() {
                error!(cache = %self.name, "close on drop failed: {}", err);
            }
        }
    }
}
