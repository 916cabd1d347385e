use crate::storage::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the cache decides which entries to write back and page out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReclamationStrategy {
    /// Idle entries are paged out under memory pressure; every page-out
    /// persists. `dirty_key` is a no-op.
    Automatic,
    /// Mutators call `dirty_key`; dirty entries are written through when
    /// they age out or overflow the tracker.
    #[default]
    Manual,
}

/// Identity cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache name, also the store name when opened through a manager
    pub name: String,

    pub strategy: ReclamationStrategy,

    /// Idle (unreferenced) entries kept in memory before the oldest is paged out
    pub max_idle_entries: usize,

    /// Dirty keys tracked before the oldest is written through
    pub max_dirty_entries: usize,

    /// Age after which a dirty key is written through
    pub max_dirty_age: Duration,

    /// Longest a caller waits on another thread's in-flight page-out
    pub expunge_wait: Duration,

    pub retry: RetryPolicy,

    /// Hot-entry budget; exceeding it fires the pressure canary
    pub max_hot_entries: Option<usize>,

    /// Log a cache summary every this many gets
    pub summary_every: u64,

    /// Number of striped admission locks
    pub admission_stripes: usize,

    /// Tick of the background page-out worker
    pub worker_interval: Duration,
}

impl CacheConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            strategy: ReclamationStrategy::default(),
            max_idle_entries: 8192,
            max_dirty_entries: 10_000,
            max_dirty_age: Duration::from_secs(5 * 60),
            expunge_wait: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            max_hot_entries: None,
            summary_every: 10_000,
            admission_stripes: 64,
            worker_interval: Duration::from_secs(1),
        }
    }

    pub fn strategy(mut self, strategy: ReclamationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_idle_entries(mut self, max: usize) -> Self {
        self.max_idle_entries = max;
        self
    }

    pub fn max_dirty_entries(mut self, max: usize) -> Self {
        self.max_dirty_entries = max;
        self
    }

    pub fn max_dirty_age(mut self, age: Duration) -> Self {
        self.max_dirty_age = age;
        self
    }

    pub fn expunge_wait(mut self, wait: Duration) -> Self {
        self.expunge_wait = wait;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_hot_entries(mut self, max: usize) -> Self {
        self.max_hot_entries = Some(max);
        self
    }

    pub fn summary_every(mut self, gets: u64) -> Self {
        self.summary_every = gets;
        self
    }

    pub fn admission_stripes(mut self, stripes: usize) -> Self {
        self.admission_stripes = stripes;
        self
    }

    pub fn worker_interval(mut self, interval: Duration) -> Self {
        self.worker_interval = interval;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Cache name cannot be empty".to_string());
        }

        if self.max_idle_entries == 0 {
            return Err("max_idle_entries must be > 0".to_string());
        }

        if self.max_dirty_entries == 0 {
            return Err("max_dirty_entries must be > 0".to_string());
        }

        if self.admission_stripes == 0 {
            return Err("admission_stripes must be > 0".to_string());
        }

        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }

        if self.expunge_wait.is_zero() {
            return Err("expunge_wait must be > 0".to_string());
        }

        if self.max_hot_entries == Some(0) {
            return Err("max_hot_entries must be > 0 when set".to_string());
        }

        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new("default")
    }
}
