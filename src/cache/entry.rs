//! Per-key coordination unit.
//!
//! An `Entry` owns the single live instance for its key and arbitrates the
//! page-out of that instance: exactly one caller wins `start_expunge`, every
//! other caller either learns the page-out does not apply or waits on the
//! completion signal.

use crate::core::Result;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Slot<V> {
    Holding(Arc<V>),
    Cleared,
}

impl<V> Slot<V> {
    fn value(&self) -> Option<Arc<V>> {
        match self {
            Slot::Holding(value) => Some(Arc::clone(value)),
            Slot::Cleared => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Live,
    ExpungeStarted,
    Expunged,
}

/// Why a page-out request was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotApplicable {
    /// Someone still holds a reference to the value
    Held,
    /// Another thread is paging it out right now
    InFlight,
    /// Already paged out
    Completed,
}

pub enum Acquire<V> {
    Acquired(Arc<V>),
    Expunging,
    Cleared,
}

pub enum ExpungeStart<V> {
    /// Caller now has exclusive persist + remove rights
    Started(Arc<V>),
    NotApplicable(NotApplicable),
    /// Live entry with no value behind it; caller owns the cleanup
    Anomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    Completed,
    TimedOut,
}

struct EntryState<V> {
    slot: Slot<V>,
    phase: Phase,
    holders: usize,
    /// Mutated since the last store write of this instance
    dirty: bool,
}

impl<V> EntryState<V> {
    fn live_value(&self) -> Option<Arc<V>> {
        match self.phase {
            Phase::Live => self.slot.value(),
            _ => None,
        }
    }
}

pub struct Entry<V> {
    key: String,
    generation: u64,
    state: Mutex<EntryState<V>>,
    /// Single-shot completion signal for waiters on an in-flight page-out
    expunged: Condvar,
    /// Serializes every store write of this instance
    write_lock: Mutex<()>,
}

impl<V> Entry<V> {
    /// New live entry. `held` counts the admitting caller as the first holder.
    pub fn new(key: &str, value: Arc<V>, generation: u64, held: bool) -> Self {
        Self {
            key: key.to_string(),
            generation,
            state: Mutex::new(EntryState {
                slot: Slot::Holding(value),
                phase: Phase::Live,
                holders: usize::from(held),
                dirty: false,
            }),
            expunged: Condvar::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn holders(&self) -> usize {
        self.state.lock().holders
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().phase == Phase::Live
    }

    /// Flags the instance as ahead of the store. Cleared only by a write.
    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Live value without taking a holder.
    pub fn peek(&self) -> Option<Arc<V>> {
        self.state.lock().live_value()
    }

    pub fn acquire(&self) -> Acquire<V> {
        let mut state = self.state.lock();
        if let Some(value) = state.live_value() {
            state.holders += 1;
            return Acquire::Acquired(value);
        }
        match state.phase {
            Phase::ExpungeStarted => Acquire::Expunging,
            _ => Acquire::Cleared,
        }
    }

    /// Adds a holder to an entry the caller already holds.
    pub(crate) fn retain(&self) {
        self.state.lock().holders += 1;
    }

    /// Drops a holder. True when this was the last one on a live entry.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert!(state.holders > 0, "release without holder on '{}'", self.key);
        state.holders = state.holders.saturating_sub(1);
        state.holders == 0 && state.phase == Phase::Live
    }

    pub fn start_expunge(&self) -> ExpungeStart<V> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::ExpungeStarted => ExpungeStart::NotApplicable(NotApplicable::InFlight),
            Phase::Expunged => ExpungeStart::NotApplicable(NotApplicable::Completed),
            Phase::Live if state.holders > 0 => ExpungeStart::NotApplicable(NotApplicable::Held),
            Phase::Live => {
                state.phase = Phase::ExpungeStarted;
                match state.slot.value() {
                    Some(value) => ExpungeStart::Started(value),
                    None => ExpungeStart::Anomaly,
                }
            }
        }
    }

    /// Blocks while a page-out is in flight, up to `timeout`.
    pub fn await_expunge(&self, timeout: Duration) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.phase == Phase::ExpungeStarted {
            if self.expunged.wait_until(&mut state, deadline).timed_out() {
                if state.phase == Phase::ExpungeStarted {
                    return AwaitOutcome::TimedOut;
                }
                break;
            }
        }
        AwaitOutcome::Completed
    }

    /// Marks the page-out complete and releases waiters.
    pub fn finish_expunge(&self) {
        let mut state = self.state.lock();
        state.slot = Slot::Cleared;
        state.phase = Phase::Expunged;
        self.expunged.notify_all();
    }

    /// Persistence failed: the entry goes back to live and waiters retry.
    pub fn abort_expunge(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::ExpungeStarted {
            state.phase = Phase::Live;
        }
        self.expunged.notify_all();
    }

    /// Runs `write` against the value under the entry's write lock.
    ///
    /// Returns false without writing once the entry has been cleared: the
    /// page-out that cleared it already persisted the final state.
    pub fn write_back(&self, write: impl FnOnce(&V) -> Result<()>) -> Result<bool> {
        let _write_guard = self.write_lock.lock();
        self.write_locked(write)
    }

    /// Like `write_back`, but only when the instance is flagged dirty.
    ///
    /// Waits for any write already in flight, so a clean answer means the
    /// store holds the latest marked state.
    pub fn write_back_if_dirty(&self, write: impl FnOnce(&V) -> Result<()>) -> Result<bool> {
        let _write_guard = self.write_lock.lock();
        if !self.state.lock().dirty {
            return Ok(false);
        }
        self.write_locked(write)
    }

    /// Caller holds `write_lock`. The flag is cleared before encoding so a
    /// mutation racing the write marks the entry again.
    fn write_locked(&self, write: impl FnOnce(&V) -> Result<()>) -> Result<bool> {
        let value = {
            let mut state = self.state.lock();
            let value = state.slot.value();
            if value.is_some() {
                state.dirty = false;
            }
            value
        };
        let Some(value) = value else {
            return Ok(false);
        };
        if let Err(err) = write(&value) {
            self.state.lock().dirty = true;
            return Err(err);
        }
        Ok(true)
    }
}

impl<V> fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("phase", &state.phase)
            .field("holders", &state.holders)
            .field("dirty", &state.dirty)
            .finish()
    }
}
