//! Reference-counted registry of store environments.
//!
//! One environment per directory, shared by every cache that lives there.
//! The environment is opened by the first `acquire` and closed when the last
//! `EnvironmentHandle` for it is dropped.

use super::engine::PersistentStore;
use super::persistence::FileStore;
use crate::core::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// A directory holding any number of named `FileStore`s.
pub struct StoreEnvironment {
    dir: PathBuf,
    stores: Mutex<HashMap<String, Arc<FileStore>>>,
    closed: AtomicBool,
}

impl StoreEnvironment {
    fn open(dir: PathBuf) -> Self {
        Self {
            dir,
            stores: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the named store, opening it on first use.
    ///
    /// With `recycle == false` any prior contents are discarded.
    pub fn open_store(&self, name: &str, recycle: bool) -> StoreResult<Arc<FileStore>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed(self.dir.display().to_string()));
        }
        let mut stores = self.stores.lock();
        let store = match stores.get(name) {
            Some(store) if !store.is_closed() => Arc::clone(store),
            _ => {
                let store = Arc::new(FileStore::open(&self.dir, name)?);
                stores.insert(name.to_string(), Arc::clone(&store));
                store
            }
        };
        if !recycle {
            store.clear()?;
        }
        Ok(store)
    }

    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn flush_all(&self) -> StoreResult<()> {
        let stores: Vec<Arc<FileStore>> = self.stores.lock().values().cloned().collect();
        for store in stores {
            if !store.is_closed() {
                store.flush()?;
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every store, continuing past failures; reports the first one.
    fn close_all(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stores: Vec<Arc<FileStore>> = self.stores.lock().drain().map(|(_, s)| s).collect();
        let mut first_err = None;
        for store in stores {
            if let Err(err) = store.close() {
                error!(store = store.name(), "error closing store: {}", err);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

struct RegistryEntry {
    env: Arc<StoreEnvironment>,
    users: usize,
}

#[derive(Default)]
pub struct StoreRegistry {
    envs: Mutex<HashMap<PathBuf, RegistryEntry>>,
}

impl StoreRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens (or joins) the environment for `dir`.
    pub fn acquire<P: AsRef<Path>>(self: &Arc<Self>, dir: P) -> StoreResult<EnvironmentHandle> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| StoreError::Io(format!("Failed to create environment directory: {}", e)))?;
        let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());

        let mut envs = self.envs.lock();
        let entry = envs.entry(key.clone()).or_insert_with(|| {
            info!(dir = %key.display(), "opening store environment");
            RegistryEntry {
                env: Arc::new(StoreEnvironment::open(key.clone())),
                users: 0,
            }
        });
        entry.users += 1;
        debug!(dir = %key.display(), users = entry.users, "acquired store environment");

        Ok(EnvironmentHandle {
            env: Arc::clone(&entry.env),
            registry: Arc::clone(self),
            key,
        })
    }

    /// Number of environments currently open
    pub fn open_count(&self) -> usize {
        self.envs.lock().len()
    }

    pub fn users<P: AsRef<Path>>(&self, dir: P) -> usize {
        let dir = dir.as_ref();
        let key = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.envs.lock().get(&key).map(|e| e.users).unwrap_or(0)
    }

    fn retain(&self, key: &Path) {
        if let Some(entry) = self.envs.lock().get_mut(key) {
            entry.users += 1;
        }
    }

    /// The last release closes the environment before the registry lock is
    /// dropped, so a concurrent `acquire` for the same directory never opens
    /// files that are still being written out.
    fn release(&self, key: &Path) {
        let mut envs = self.envs.lock();
        let Some(entry) = envs.get_mut(key) else {
            return;
        };
        if entry.users > 1 {
            entry.users -= 1;
            return;
        }
        if let Some(entry) = envs.remove(key) {
            info!(dir = %key.display(), "closing store environment");
            if let Err(err) = entry.env.close_all() {
                error!(dir = %key.display(), "error closing store environment: {}", err);
            }
        }
    }
}

/// Counted user of a `StoreEnvironment`.
pub struct EnvironmentHandle {
    env: Arc<StoreEnvironment>,
    registry: Arc<StoreRegistry>,
    key: PathBuf,
}

impl Deref for EnvironmentHandle {
    type Target = StoreEnvironment;

    fn deref(&self) -> &StoreEnvironment {
        &self.env
    }
}

impl Clone for EnvironmentHandle {
    fn clone(&self) -> Self {
        self.registry.retain(&self.key);
        Self {
            env: Arc::clone(&self.env),
            registry: Arc::clone(&self.registry),
            key: self.key.clone(),
        }
    }
}

impl Drop for EnvironmentHandle {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}
