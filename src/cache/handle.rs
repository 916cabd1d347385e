use super::entry::Entry;
use super::reclaim::ReclamationNotifier;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Counted reference to the live instance for a key.
///
/// While any `CacheRef` for an entry exists the entry cannot be paged out.
/// Dropping the last one hands the entry to the reclamation notifier as idle.
pub struct CacheRef<V> {
    value: Arc<V>,
    entry: Arc<Entry<V>>,
    notifier: Weak<dyn ReclamationNotifier<V>>,
}

impl<V> CacheRef<V> {
    /// Wraps a value whose holder count already includes this reference.
    pub(crate) fn new(
        value: Arc<V>,
        entry: Arc<Entry<V>>,
        notifier: Weak<dyn ReclamationNotifier<V>>,
    ) -> Self {
        Self {
            value,
            entry,
            notifier,
        }
    }

    pub fn key(&self) -> &str {
        self.entry.key()
    }

    /// Admission generation of the identity group this instance belongs to.
    pub fn generation(&self) -> u64 {
        self.entry.generation()
    }

    /// True when both references point at the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.value, &b.value)
    }
}

impl<V> Deref for CacheRef<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<V> Clone for CacheRef<V> {
    fn clone(&self) -> Self {
        self.entry.retain();
        Self {
            value: Arc::clone(&self.value),
            entry: Arc::clone(&self.entry),
            notifier: Weak::clone(&self.notifier),
        }
    }
}

impl<V> Drop for CacheRef<V> {
    fn drop(&mut self) {
        if self.entry.release() {
            if let Some(notifier) = self.notifier.upgrade() {
                notifier.on_idle(&self.entry);
            }
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheRef<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("key", &self.entry.key())
            .field("generation", &self.entry.generation())
            .field("value", &self.value)
            .finish()
    }
}
