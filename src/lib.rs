// ============================================================================
// oicache Library
// ============================================================================

//! Identity-preserving write-back object cache.
//!
//! Long-running crawlers keep mutable per-entity state (per host, per server,
//! per queue) that many workers update in place. `IdentityCache` guarantees
//! that while a key is in memory every caller gets the same instance, pages
//! idle instances out to a `PersistentStore` when the working set grows, and
//! promotes them back on the next lookup without losing an update.
//!
//! ```
//! use oicache::{CacheConfig, CacheLink, IdentityCache, IdentityCacheable, MemoryStore};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Counter {
//!     key: String,
//!     hits: AtomicU64,
//!     #[serde(skip)]
//!     link: CacheLink,
//! }
//!
//! impl IdentityCacheable for Counter {
//!     fn key(&self) -> &str {
//!         &self.key
//!     }
//!
//!     fn cache_link(&self) -> &CacheLink {
//!         &self.link
//!     }
//! }
//!
//! # fn main() -> oicache::Result<()> {
//! let store = Arc::new(MemoryStore::new("counters"));
//! let cache: IdentityCache<Counter> = IdentityCache::open(store, CacheConfig::new("counters"))?;
//!
//! let counter = cache.get_or_create("host:example.com", || Counter {
//!     key: "host:example.com".into(),
//!     hits: AtomicU64::new(0),
//!     link: CacheLink::new(),
//! })?;
//! counter.hits.fetch_add(1, Ordering::SeqCst);
//! counter.make_dirty()?;
//!
//! cache.sync()?;
//! assert_eq!(cache.size()?, 1);
//! # cache.close()
//! # }
//! ```

pub mod cache;
pub mod core;
pub mod crawl;
pub mod facade;
pub mod storage;

pub use cache::{
    CacheConfig, CacheRef, CacheStats, DrainReport, PageOutOutcome, PageOutWorker,
    ReclamationStrategy,
};
pub use crate::core::{CacheError, CacheLink, DirtySink, IdentityCacheable, Result, StoreError, StoreResult};
pub use facade::{CacheManager, IdentityCache};
pub use storage::{
    EnvironmentHandle, FileStore, MemoryStore, PersistentStore, RetryPolicy, StoreRegistry,
};
