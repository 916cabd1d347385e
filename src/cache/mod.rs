pub mod backing;
pub mod config;
pub mod dirty;
pub mod entry;
pub mod handle;
pub mod index;
pub mod reclaim;
pub mod stats;
pub mod worker;

pub use backing::BackingStore;
pub use config::{CacheConfig, ReclamationStrategy};
pub use entry::NotApplicable;
pub use handle::CacheRef;
pub use reclaim::{AutomaticNotifier, ManualNotifier, PressureCanary, ReclamationNotifier};
pub use stats::{CacheStats, DrainReport, PageOutOutcome};
pub use worker::{Drainable, PageOutWorker, spawn_page_out_worker};
