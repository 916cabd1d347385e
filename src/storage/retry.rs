use crate::core::{CacheError, Result, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Configuration for retry behavior on transient store contention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 24,
            initial_backoff_ms: 1,
            max_backoff_ms: 250,
        }
    }
}

/// Per-cache bookkeeping shared by every retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Set once the first contention warning has been logged
    warned: AtomicBool,
    retries: AtomicU64,
}

impl RetryState {
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Exponential backoff for the given (1-based) attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }

    /// Runs `f`, retrying contention errors until `max_attempts` is reached.
    pub fn run<T>(
        &self,
        op: &str,
        key: &str,
        state: &RetryState,
        mut f: impl FnMut() -> StoreResult<T>,
    ) -> Result<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    if attempt >= max_attempts {
                        error!(op, key, attempts = attempt, "store contention not resolved: {}", err);
                        return Err(CacheError::ContentionExhausted {
                            key: key.to_string(),
                            attempts: attempt,
                        });
                    }
                    if !state.warned.swap(true, Ordering::Relaxed) {
                        warn!(op, key, "store contention, retrying up to {} times: {}", max_attempts, err);
                    }
                    state.retries.fetch_add(1, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(self.backoff_ms(attempt)));
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
