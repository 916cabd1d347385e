use super::error::{CacheError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Weak;

/// Receiver of "this key was mutated" notifications.
///
/// Implemented by the cache; values only ever see it behind a `Weak`, so a
/// value outliving its cache never keeps the cache alive.
pub trait DirtySink: Send + Sync {
    fn dirty_key(&self, key: &str) -> Result<()>;
}

/// Back-reference from a cached value to the cache that owns it.
///
/// Embed one in every `IdentityCacheable` value and mark it
/// `#[serde(skip)]`; the cache attaches itself at admission.
#[derive(Default)]
pub struct CacheLink {
    sink: RwLock<Option<Weak<dyn DirtySink>>>,
}

impl CacheLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Weak<dyn DirtySink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn is_attached(&self) -> bool {
        self.sink
            .read()
            .as_ref()
            .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Routes to the owning cache's `dirty_key`.
    ///
    /// A value that was never admitted has nothing to write back; a value
    /// whose cache is gone would lose the update, which is an error.
    pub fn make_dirty(&self, key: &str) -> Result<()> {
        let sink = match self.sink.read().as_ref() {
            Some(weak) => weak.upgrade(),
            None => return Ok(()),
        };
        match sink {
            Some(sink) => sink.dirty_key(key),
            None => Err(CacheError::Closed(format!("owner of '{}' dropped", key))),
        }
    }
}

impl Clone for CacheLink {
    fn clone(&self) -> Self {
        Self {
            sink: RwLock::new(self.sink.read().clone()),
        }
    }
}

impl fmt::Debug for CacheLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLink")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Contract for values held by an `IdentityCache`.
///
/// Values are shared by identity across threads, so any mutable state must
/// use interior mutability. After mutating, call `make_dirty()` so that the
/// manual reclamation strategy knows to write the value back. Mark before the
/// last `CacheRef` is dropped: a clean idle entry may be paged out without a
/// write.
pub trait IdentityCacheable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable key; must equal the key the value is cached under.
    fn key(&self) -> &str;

    fn cache_link(&self) -> &CacheLink;

    fn set_identity_cache(&self, sink: Weak<dyn DirtySink>) {
        self.cache_link().attach(sink);
    }

    fn make_dirty(&self) -> Result<()> {
        self.cache_link().make_dirty(self.key())
    }
}
