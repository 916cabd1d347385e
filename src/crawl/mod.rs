//! Crawl-side users of the identity cache: per-host and per-server state.

pub mod host;
pub mod server;
pub mod server_cache;
pub mod stats;

pub use host::{CrawlHost, IpTtl};
pub use server::CrawlServer;
pub use server_cache::{CrawlError, ServerCache};
pub use stats::FetchStats;
