//! Reclamation strategies.
//!
//! Entries nobody references sit in a bounded idle pool. Overflowing the pool,
//! an explicit request, or the pressure canary moves entries onto the reclaim
//! queue, which the drain loop turns into page-outs. The two strategies differ
//! only in what a page-out has to persist and in how mutations are tracked.

use super::config::{CacheConfig, ReclamationStrategy};
use super::dirty::DirtyTracker;
use super::entry::Entry;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// LRU of live entries with no holders.
pub struct IdlePool<V> {
    entries: Mutex<LruCache<String, Arc<Entry<V>>>>,
}

impl<V> IdlePool<V> {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records the entry as idle; returns the entry pushed out by the cap.
    pub fn push(&self, entry: &Arc<Entry<V>>) -> Option<Arc<Entry<V>>> {
        let displaced = self
            .entries
            .lock()
            .push(entry.key().to_string(), Arc::clone(entry));
        match displaced {
            Some((key, displaced)) if key != entry.key() => Some(displaced),
            _ => None,
        }
    }

    pub fn remove_if_same(&self, entry: &Arc<Entry<V>>) {
        let mut entries = self.entries.lock();
        let same = entries
            .peek(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if same {
            entries.pop(entry.key());
        }
    }

    pub fn take_all(&self) -> Vec<Arc<Entry<V>>> {
        let mut entries = self.entries.lock();
        let mut taken = Vec::with_capacity(entries.len());
        while let Some((_, entry)) = entries.pop_lru() {
            taken.push(entry);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO of entries due for page-out.
pub struct ReclaimQueue<V> {
    queue: Mutex<VecDeque<Arc<Entry<V>>>>,
}

impl<V> ReclaimQueue<V> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, entry: Arc<Entry<V>>) {
        self.queue.lock().push_back(entry);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = Arc<Entry<V>>>) {
        self.queue.lock().extend(entries);
    }

    pub fn poll(&self) -> Option<Arc<Entry<V>>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V> Default for ReclaimQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Secondary trigger that flushes the idle pool when the hot set grows past
/// its budget. Re-arms after every firing.
#[derive(Debug)]
pub struct PressureCanary {
    max_hot: Option<usize>,
    firings: AtomicU64,
}

impl PressureCanary {
    pub fn new(max_hot: Option<usize>) -> Self {
        Self {
            max_hot,
            firings: AtomicU64::new(0),
        }
    }

    pub fn check(&self, hot: usize) -> bool {
        match self.max_hot {
            Some(max) if hot > max => {
                self.firings.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn firings(&self) -> u64 {
        self.firings.load(Ordering::Relaxed)
    }
}

/// Idle pool and reclaim queue shared by both strategies.
pub struct ReclaimCore<V> {
    idle: IdlePool<V>,
    queue: ReclaimQueue<V>,
}

impl<V> ReclaimCore<V> {
    pub fn new(max_idle: NonZeroUsize) -> Self {
        Self {
            idle: IdlePool::new(max_idle),
            queue: ReclaimQueue::new(),
        }
    }
}

/// Decides which entries get paged out and what a page-out must persist.
pub trait ReclamationNotifier<V>: Send + Sync {
    fn strategy(&self) -> ReclamationStrategy;

    fn core(&self) -> &ReclaimCore<V>;

    /// The last holder let go of this entry.
    fn on_idle(&self, entry: &Arc<Entry<V>>) {
        let core = self.core();
        if let Some(overflow) = core.idle.push(entry) {
            core.queue.push(overflow);
        }
    }

    /// Explicit reclamation signal for one entry.
    fn request(&self, entry: Arc<Entry<V>>) {
        self.core().queue.push(entry);
    }

    fn poll(&self) -> Option<Arc<Entry<V>>> {
        self.core().queue.poll()
    }

    fn pending(&self) -> usize {
        self.core().queue.len()
    }

    fn idle_len(&self) -> usize {
        self.core().idle.len()
    }

    /// Canary fired: every idle entry becomes a page-out candidate.
    fn on_pressure(&self) -> usize {
        let core = self.core();
        let idle = core.idle.take_all();
        let moved = idle.len();
        core.queue.extend(idle);
        moved
    }

    /// Page-out of this entry finished.
    fn forget(&self, entry: &Arc<Entry<V>>) {
        self.core().idle.remove_if_same(entry);
    }

    /// Records a mutation; returns entries due for write-through.
    fn on_dirty(&self, entry: &Arc<Entry<V>>) -> Vec<Arc<Entry<V>>>;

    /// Entries whose dirty mark has aged out.
    fn expire_dirty(&self) -> Vec<Arc<Entry<V>>>;

    /// Drops any tracker mark for an entry being paged out. The entry's own
    /// dirty flag decides whether the page-out writes.
    fn clear_dirty(&self, entry: &Arc<Entry<V>>);

    /// Empties the dirty tracker.
    fn drain_dirty(&self) -> Vec<Arc<Entry<V>>>;

    fn dirty_len(&self) -> usize;
}

/// Every page-out persists; mutations need no tracking.
pub struct AutomaticNotifier<V> {
    core: ReclaimCore<V>,
}

impl<V> AutomaticNotifier<V> {
    pub fn new(max_idle: NonZeroUsize) -> Self {
        Self {
            core: ReclaimCore::new(max_idle),
        }
    }
}

impl<V: Send + Sync> ReclamationNotifier<V> for AutomaticNotifier<V> {
    fn strategy(&self) -> ReclamationStrategy {
        ReclamationStrategy::Automatic
    }

    fn core(&self) -> &ReclaimCore<V> {
        &self.core
    }

    fn on_dirty(&self, _entry: &Arc<Entry<V>>) -> Vec<Arc<Entry<V>>> {
        Vec::new()
    }

    fn expire_dirty(&self) -> Vec<Arc<Entry<V>>> {
        Vec::new()
    }

    fn clear_dirty(&self, _entry: &Arc<Entry<V>>) {}

    fn drain_dirty(&self) -> Vec<Arc<Entry<V>>> {
        Vec::new()
    }

    fn dirty_len(&self) -> usize {
        0
    }
}

/// Mutators mark keys dirty; only dirty entries are written on page-out.
pub struct ManualNotifier<V> {
    core: ReclaimCore<V>,
    dirty: Mutex<DirtyTracker<V>>,
}

impl<V> ManualNotifier<V> {
    pub fn new(max_idle: NonZeroUsize, max_dirty: NonZeroUsize, max_dirty_age: Duration) -> Self {
        Self {
            core: ReclaimCore::new(max_idle),
            dirty: Mutex::new(DirtyTracker::new(max_dirty, max_dirty_age)),
        }
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty.lock().contains(key)
    }
}

impl<V: Send + Sync> ReclamationNotifier<V> for ManualNotifier<V> {
    fn strategy(&self) -> ReclamationStrategy {
        ReclamationStrategy::Manual
    }

    fn core(&self) -> &ReclaimCore<V> {
        &self.core
    }

    fn on_dirty(&self, entry: &Arc<Entry<V>>) -> Vec<Arc<Entry<V>>> {
        entry.mark_dirty();
        self.dirty.lock().mark(entry, Instant::now())
    }

    fn expire_dirty(&self) -> Vec<Arc<Entry<V>>> {
        self.dirty.lock().expire(Instant::now())
    }

    fn clear_dirty(&self, entry: &Arc<Entry<V>>) {
        self.dirty.lock().take(entry);
    }

    fn drain_dirty(&self) -> Vec<Arc<Entry<V>>> {
        self.dirty.lock().drain()
    }

    fn dirty_len(&self) -> usize {
        self.dirty.lock().len()
    }
}

/// Builds the notifier selected by `config.strategy`.
pub fn notifier_for<V: Send + Sync + 'static>(
    config: &CacheConfig,
) -> Result<Arc<dyn ReclamationNotifier<V>>, String> {
    let max_idle = NonZeroUsize::new(config.max_idle_entries)
        .ok_or_else(|| "max_idle_entries must be > 0".to_string())?;
    let notifier: Arc<dyn ReclamationNotifier<V>> = match config.strategy {
        ReclamationStrategy::Automatic => Arc::new(AutomaticNotifier::new(max_idle)),
        ReclamationStrategy::Manual => {
            let max_dirty = NonZeroUsize::new(config.max_dirty_entries)
                .ok_or_else(|| "max_dirty_entries must be > 0".to_string())?;
            Arc::new(ManualNotifier::new(max_idle, max_dirty, config.max_dirty_age))
        }
    };
    Ok(notifier)
}
