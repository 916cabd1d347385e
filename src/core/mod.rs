pub mod error;
pub mod traits;

pub use error::{CacheError, Result, StoreError, StoreResult};
pub use traits::{CacheLink, DirtySink, IdentityCacheable};
