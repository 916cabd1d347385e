use crate::core::StoreResult;

/// Persistent store trait - allows pluggable durable backends
///
/// A sorted string-keyed map of opaque byte values. Writes may be buffered;
/// only `flush` guarantees they survive a crash.
pub trait PersistentStore: Send + Sync {
    /// Name of the database this store serves
    fn name(&self) -> &str;

    /// Get the value for a key
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Atomically store the value unless the key exists; returns the existing value
    fn put_if_absent(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>>;

    /// Store the value, returning the previous one
    fn put(&self, key: &str, value: Vec<u8>) -> StoreResult<Option<Vec<u8>>>;

    /// Remove a key, returning the previous value
    fn remove(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// All keys, in ascending order
    fn keys(&self) -> StoreResult<Vec<String>>;

    /// Number of keys
    fn len(&self) -> StoreResult<usize>;

    /// Check if the store holds no keys
    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Force durability of buffered writes
    fn flush(&self) -> StoreResult<()>;

    /// Remove every key
    fn clear(&self) -> StoreResult<()>;

    /// Flush and release the underlying handle; later calls fail with `Closed`
    fn close(&self) -> StoreResult<()>;
}
