use crate::core::{Result, StoreError};
use crate::storage::{PersistentStore, RetryPolicy, RetryState};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed view of a `PersistentStore`.
///
/// Values travel as MessagePack; every call goes through the retry policy so
/// contention never reaches the caller until the attempts are spent.
pub struct BackingStore<V> {
    store: Arc<dyn PersistentStore>,
    retry: RetryPolicy,
    retry_state: RetryState,
    _value: PhantomData<fn() -> V>,
}

impl<V> BackingStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn PersistentStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            retry_state: RetryState::default(),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub fn retries(&self) -> u64 {
        self.retry_state.retries()
    }

    pub fn encode(value: &V) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value)
            .map_err(|e| StoreError::Codec(format!("Failed to encode value: {}", e)).into())
    }

    pub fn decode(bytes: &[u8]) -> Result<V> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StoreError::Codec(format!("Failed to decode value: {}", e)).into())
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        let bytes = self
            .retry
            .run("get", key, &self.retry_state, || self.store.get(key))?;
        bytes.map(|b| Self::decode(&b)).transpose()
    }

    /// Stores `value` unless the key already exists; returns the stored value
    /// that won instead.
    pub fn put_if_absent(&self, key: &str, value: &V) -> Result<Option<V>> {
        let bytes = Self::encode(value)?;
        let existing = self.retry.run("put_if_absent", key, &self.retry_state, || {
            self.store.put_if_absent(key, bytes.clone())
        })?;
        existing.map(|b| Self::decode(&b)).transpose()
    }

    pub fn put(&self, key: &str, value: &V) -> Result<()> {
        let bytes = Self::encode(value)?;
        self.retry.run("put", key, &self.retry_state, || {
            self.store.put(key, bytes.clone()).map(|_| ())
        })
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.retry
            .run("keys", self.store.name(), &self.retry_state, || self.store.keys())
    }

    pub fn len(&self) -> Result<usize> {
        self.retry
            .run("len", self.store.name(), &self.retry_state, || self.store.len())
    }

    pub fn flush(&self) -> Result<()> {
        self.retry
            .run("flush", self.store.name(), &self.retry_state, || self.store.flush())
    }

    pub fn close(&self) -> Result<()> {
        Ok(self.store.close()?)
    }
}
