pub mod cache;
pub mod manager;

pub use cache::IdentityCache;
pub use manager::{CacheManager, Checkpointable};
