use super::entry::Entry;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct DirtyMark<V> {
    entry: Arc<Entry<V>>,
    marked_at: Instant,
}

/// Bounded record of entries that must be written back.
///
/// Ordered by last mark time. Anything pushed out by the size cap or older
/// than `max_age` is handed back to the caller for write-through.
pub struct DirtyTracker<V> {
    marks: LruCache<String, DirtyMark<V>>,
    max_age: Duration,
}

impl<V> DirtyTracker<V> {
    pub fn new(capacity: NonZeroUsize, max_age: Duration) -> Self {
        Self {
            marks: LruCache::new(capacity),
            max_age,
        }
    }

    /// Marks (or re-marks) the entry; returns entries due for write-through.
    pub fn mark(&mut self, entry: &Arc<Entry<V>>, now: Instant) -> Vec<Arc<Entry<V>>> {
        let mut due = Vec::new();
        let mark = DirtyMark {
            entry: Arc::clone(entry),
            marked_at: now,
        };
        if let Some((key, displaced)) = self.marks.push(entry.key().to_string(), mark) {
            if key != entry.key() {
                due.push(displaced.entry);
            }
        }
        due.extend(self.expire(now));
        due
    }

    /// Pops every mark older than `max_age`.
    pub fn expire(&mut self, now: Instant) -> Vec<Arc<Entry<V>>> {
        let mut due = Vec::new();
        loop {
            let expired = match self.marks.peek_lru() {
                Some((_, mark)) => now.saturating_duration_since(mark.marked_at) >= self.max_age,
                None => false,
            };
            if !expired {
                break;
            }
            if let Some((_, mark)) = self.marks.pop_lru() {
                due.push(mark.entry);
            }
        }
        due
    }

    /// Removes the mark if it belongs to this exact entry. True if it was dirty.
    pub fn take(&mut self, entry: &Arc<Entry<V>>) -> bool {
        let same = self
            .marks
            .peek(entry.key())
            .is_some_and(|mark| Arc::ptr_eq(&mark.entry, entry));
        if same {
            self.marks.pop(entry.key());
        }
        same
    }

    pub fn drain(&mut self) -> Vec<Arc<Entry<V>>> {
        let mut drained = Vec::with_capacity(self.marks.len());
        while let Some((_, mark)) = self.marks.pop_lru() {
            drained.push(mark.entry);
        }
        drained
    }

    pub fn contains(&self, key: &str) -> bool {
        self.marks.contains(key)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}
