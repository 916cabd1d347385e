use super::cache::IdentityCache;
use crate::cache::CacheConfig;
use crate::core::{CacheError, IdentityCacheable, Result};
use crate::storage::EnvironmentHandle;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A cache the manager can checkpoint and close without knowing its value type.
pub trait Checkpointable: Send + Sync {
    fn cache_name(&self) -> &str;

    fn is_open(&self) -> bool;

    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
}

impl<V: IdentityCacheable> Checkpointable for IdentityCache<V> {
    fn cache_name(&self) -> &str {
        self.name()
    }

    fn is_open(&self) -> bool {
        IdentityCache::is_open(self)
    }

    fn sync(&self) -> Result<()> {
        IdentityCache::sync(self)
    }

    fn close(&self) -> Result<()> {
        IdentityCache::close(self)
    }
}

struct ManagedCache {
    typed: Box<dyn Any + Send + Sync>,
    cache: Arc<dyn Checkpointable>,
}

/// Named identity caches sharing one store environment.
pub struct CacheManager {
    env: Mutex<Option<EnvironmentHandle>>,
    caches: Mutex<BTreeMap<String, ManagedCache>>,
}

impl CacheManager {
    pub fn new(env: EnvironmentHandle) -> Self {
        info!(dir = %env.dir().display(), "cache manager opened");
        Self {
            env: Mutex::new(Some(env)),
            caches: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.env.lock().is_some()
    }

    /// The open cache called `name`, or a new one with the default config.
    ///
    /// With `recycle == false` a newly opened cache starts from an empty store.
    pub fn object_cache<V: IdentityCacheable>(&self, name: &str, recycle: bool) -> Result<IdentityCache<V>> {
        self.object_cache_with(CacheConfig::new(name), recycle)
    }

    pub fn object_cache_with<V: IdentityCacheable>(
        &self,
        config: CacheConfig,
        recycle: bool,
    ) -> Result<IdentityCache<V>> {
        let env = self.env.lock();
        let env = env
            .as_ref()
            .ok_or_else(|| CacheError::Closed(format!("cache manager for '{}'", config.name)))?;

        let mut caches = self.caches.lock();
        if let Some(existing) = caches.get(&config.name) {
            if existing.cache.is_open() {
                return existing
                    .typed
                    .downcast_ref::<IdentityCache<V>>()
                    .cloned()
                    .ok_or_else(|| CacheError::TypeMismatch {
                        name: config.name.clone(),
                    });
            }
        }

        let store = env.open_store(&config.name, recycle)?;
        let cache = IdentityCache::<V>::open(store, config)?;
        debug!(cache = cache.name(), recycle, "cache manager opened cache");
        caches.insert(
            cache.name().to_string(),
            ManagedCache {
                typed: Box::new(cache.clone()),
                cache: Arc::new(cache.clone()),
            },
        );
        Ok(cache)
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.lock().keys().cloned().collect()
    }

    /// Syncs every open cache, then flushes the environment.
    ///
    /// Keeps going past a failing cache; the first error is returned.
    pub fn checkpoint(&self) -> Result<()> {
        let caches = self.open_caches();
        let mut first_err = None;
        for cache in &caches {
            if let Err(err) = cache.sync() {
                error!(cache = cache.cache_name(), "checkpoint sync failed: {}", err);
                first_err.get_or_insert(err);
            }
        }
        if let Some(env) = self.env.lock().as_ref() {
            if let Err(err) = env.flush_all() {
                error!(dir = %env.dir().display(), "checkpoint flush failed: {}", err);
                first_err.get_or_insert(err.into());
            }
        }
        debug!(caches = caches.len(), "checkpoint finished");
        first_err.map_or(Ok(()), Err)
    }

    /// Closes every cache, then releases the environment.
    pub fn close(&self) -> Result<()> {
        let caches: Vec<ManagedCache> = {
            let mut caches = self.caches.lock();
            std::mem::take(&mut *caches).into_values().collect()
        };
        let mut first_err = None;
        for managed in &caches {
            if let Err(err) = managed.cache.close() {
                error!(cache = managed.cache.cache_name(), "error closing cache: {}", err);
                first_err.get_or_insert(err);
            }
        }
        if let Some(env) = self.env.lock().take() {
            info!(dir = %env.dir().display(), caches = caches.len(), "cache manager closed");
        }
        first_err.map_or(Ok(()), Err)
    }

    fn open_caches(&self) -> Vec<Arc<dyn Checkpointable>> {
        self.caches
            .lock()
            .values()
            .filter(|managed| managed.cache.is_open())
            .map(|managed| Arc::clone(&managed.cache))
            .collect()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(err) = self.close() {
                error!("cache manager close on drop failed: {}", err);
            }
        }
    }
}
