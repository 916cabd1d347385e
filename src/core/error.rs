use thiserror::Error;

/// Errors raised by a `PersistentStore` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Lock conflict or similar short-lived contention. Safe to retry.
    #[error("Store contention: {0}")]
    Contention(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Corrupt store: {0}")]
    Corrupt(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Store '{0}' is closed")]
    Closed(String),
}

impl StoreError {
    /// Only contention is worth another attempt; everything else is fatal
    /// for the operation that raised it.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Store contention on '{key}' persisted after {attempts} attempts")]
    ContentionExhausted { key: String, attempts: u32 },

    #[error("Timed out after {waited_ms}ms waiting for page-out of '{key}'")]
    AwaitTimeout { key: String, waited_ms: u64 },

    #[error("Cache '{0}' is closed")]
    Closed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache '{name}' is already open with a different value type")]
    TypeMismatch { name: String },

    #[error("Page-out worker error: {0}")]
    Worker(String),
}

impl CacheError {
    /// Errors after which the cache instance should be considered unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::Store(StoreError::Io(_))
                | CacheError::Store(StoreError::Corrupt(_))
                | CacheError::Store(StoreError::Closed(_))
                | CacheError::Closed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_contention_is_transient() {
        assert!(StoreError::Contention("lock".into()).is_transient());
        assert!(!StoreError::Io("disk".into()).is_transient());
        assert!(!StoreError::Codec("bad".into()).is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        let io: CacheError = StoreError::Io("disk full".into()).into();
        assert!(io.is_fatal());

        let timeout = CacheError::AwaitTimeout {
            key: "k".into(),
            waited_ms: 10,
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.to_string().contains("'k'"));
    }
}
